//! Shared helpers used across the crate.

/// Serde support for human-readable durations ("500ms", "30s", "5m", "1h").
///
/// Also accepts the `{secs, nanos}` object form so round-tripped JSON
/// configuration keeps parsing.
pub mod duration_serde {
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        use serde::Deserialize;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Parts { secs: u64, nanos: Option<u32> },
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => parse_duration_string(&s).map_err(Error::custom),
            Repr::Parts { secs, nanos } => Ok(Duration::new(secs, nanos.unwrap_or(0))),
        }
    }

    /// Suffix table, longest unit first so "ms" wins over "s".
    const UNITS: &[(&str, f64)] = &[("ms", 1e-3), ("h", 3600.0), ("m", 60.0), ("s", 1.0)];

    pub(crate) fn parse_duration_string(s: &str) -> Result<Duration, String> {
        let text = s.trim();
        if text.is_empty() {
            return Err("empty duration string".to_string());
        }

        let (number, seconds_per_unit) = UNITS
            .iter()
            .find_map(|(suffix, scale)| text.strip_suffix(suffix).map(|n| (n, *scale)))
            .ok_or_else(|| format!("missing duration unit: {text}"))?;

        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| format!("invalid duration value: {text}"))?;
        if !value.is_finite() || value < 0.0 {
            return Err(format!("invalid duration value: {text}"));
        }
        Ok(Duration::from_secs_f64(value * seconds_per_unit))
    }

    /// Optional-duration variant for fields that may be omitted.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_str(&format!("{}s", d.as_secs())),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            use serde::de::Error;
            let value = Option::<String>::deserialize(deserializer)?;
            match value {
                Some(s) => super::parse_duration_string(&s)
                    .map(Some)
                    .map_err(Error::custom),
                None => Ok(None),
            }
        }
    }

}

/// Expand `${VAR}` references against the process environment.
///
/// Unknown variables expand to the empty string, matching what the
/// configuration loader expects for optional secrets.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                if let Ok(value) = std::env::var(name) {
                    out.push_str(&value);
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::expand_env;

    #[test]
    fn expands_known_variables() {
        std::env::set_var("RELAY_TEST_KEY", "sk-abc123");
        assert_eq!(expand_env("${RELAY_TEST_KEY}"), "sk-abc123");
        assert_eq!(expand_env("prefix-${RELAY_TEST_KEY}-suffix"), "prefix-sk-abc123-suffix");
    }

    #[test]
    fn unknown_variables_expand_empty() {
        assert_eq!(expand_env("${RELAY_TEST_DOES_NOT_EXIST}"), "");
    }

    #[test]
    fn plain_strings_pass_through() {
        assert_eq!(expand_env("no-vars-here"), "no-vars-here");
        assert_eq!(expand_env("${unterminated"), "${unterminated");
    }
}
