//! Duration type with human-readable parsing.
//!
//! Grammar shared by the config file and the connection string: a positive
//! decimal with an optional unit suffix in `{s, m, h}`; a bare number is
//! seconds. Examples: `30`, `1.5s`, `5m`, `2h`.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Duration stored internally in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Duration(u64);

impl Duration {
    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs * 1000)
    }

    pub const fn from_mins(mins: u64) -> Self {
        Duration(mins * 60 * 1000)
    }

    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    pub const fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Converts to `std::time::Duration` for use with tokio and std APIs.
    pub const fn as_std(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.0)
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl From<Duration> for std::time::Duration {
    fn from(d: Duration) -> Self {
        d.as_std()
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}s", self.0 / 1000)
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

impl FromStr for Duration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s)
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let (num_str, multiplier_ms) = match s.as_bytes()[s.len() - 1] {
        b's' | b'S' => (&s[..s.len() - 1], 1000f64),
        b'm' | b'M' => (&s[..s.len() - 1], 60_000f64),
        b'h' | b'H' => (&s[..s.len() - 1], 3_600_000f64),
        _ => (s, 1000f64), // no suffix: seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration {s:?}: expected a number with optional s/m/h suffix"))?;
    if num < 0.0 || !num.is_finite() {
        return Err(format!("duration {s:?} must be a positive number"));
    }

    Ok(Duration((num * multiplier_ms) as u64))
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl de::Visitor<'_> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration like 30, \"1.5s\", \"5m\" or \"2h\"")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                if v < 0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(Duration::from_secs(v as u64))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
            where
                E: de::Error,
            {
                if v < 0.0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(Duration((v * 1000.0) as u64))
            }

            fn visit_str<E>(self, s: &str) -> Result<Duration, E>
            where
                E: de::Error,
            {
                parse_duration(s).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_numbers_as_seconds() {
        assert_eq!(parse_duration("0").unwrap(), Duration(0));
        assert_eq!(parse_duration("30").unwrap(), Duration(30_000));
        assert_eq!(parse_duration("1.5").unwrap(), Duration(1500));
    }

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse_duration("10s").unwrap(), Duration(10_000));
        assert_eq!(parse_duration("5m").unwrap(), Duration(300_000));
        assert_eq!(parse_duration("2h").unwrap(), Duration(7_200_000));
        assert_eq!(parse_duration("15M").unwrap(), Duration(900_000));
        assert_eq!(parse_duration("0.5s").unwrap(), Duration(500));
    }

    #[test]
    fn trims_whitespace() {
        assert_eq!(parse_duration("  10s  ").unwrap(), Duration(10_000));
        assert_eq!(parse_duration("10 s").unwrap(), Duration(10_000));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn deserializes_from_toml() {
        #[derive(Deserialize)]
        struct Section {
            ttl: Duration,
            drain: Duration,
        }
        let section: Section = toml::from_str("ttl = \"15m\"\ndrain = 10").unwrap();
        assert_eq!(section.ttl, Duration::from_mins(15));
        assert_eq!(section.drain, Duration::from_secs(10));
    }

    #[test]
    fn display_round_trips() {
        assert_eq!(Duration::from_secs(10).to_string(), "10s");
        assert_eq!(Duration::from_millis(1500).to_string(), "1500ms");
    }
}
