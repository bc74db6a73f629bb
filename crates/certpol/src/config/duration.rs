//! Durations written as seconds or as time strings (`"7d"`, `"1d12h"`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Whole seconds, read from an integer or a time string
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HumanDuration(u64);

impl HumanDuration {
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    #[must_use]
    pub const fn as_secs(self) -> u64 {
        self.0
    }

    /// As a signed chrono duration, saturating on overflow
    #[must_use]
    pub fn to_chrono(self) -> chrono::Duration {
        chrono::Duration::try_seconds(i64::try_from(self.0).unwrap_or(i64::MAX))
            .unwrap_or(chrono::Duration::MAX)
    }
}

impl FromStr for HumanDuration {
    type Err = String;

    /// Accepts `s`, `m`, `h`, `d` and `w` units, concatenated in any order.
    /// A bare number is seconds.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".into());
        }
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Self(secs));
        }

        let mut total: u64 = 0;
        let mut digits = String::new();
        for c in s.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let unit = match c.to_ascii_lowercase() {
                's' => 1,
                'm' => 60,
                'h' => 3_600,
                'd' => 86_400,
                'w' => 604_800,
                _ => return Err(format!("unknown time unit {c:?} in {s:?}")),
            };
            let n: u64 = digits
                .parse()
                .map_err(|_| format!("missing number before {c:?} in {s:?}"))?;
            digits.clear();
            total = n
                .checked_mul(unit)
                .and_then(|v| total.checked_add(v))
                .ok_or_else(|| format!("duration {s:?} is too large"))?;
        }
        if !digits.is_empty() {
            return Err(format!("trailing number without unit in {s:?}"));
        }
        Ok(Self(total))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 4] = [(604_800, "w"), (86_400, "d"), (3_600, "h"), (60, "m")];
        if self.0 == 0 {
            return f.write_str("0s");
        }
        let mut rest = self.0;
        for (size, unit) in UNITS {
            if rest >= size {
                write!(f, "{}{unit}", rest / size)?;
                rest %= size;
            }
        }
        if rest > 0 {
            write!(f, "{rest}s")?;
        }
        Ok(())
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Self(secs)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!("30s".parse::<HumanDuration>().unwrap().as_secs(), 30);
        assert_eq!("15m".parse::<HumanDuration>().unwrap().as_secs(), 900);
        assert_eq!("12h".parse::<HumanDuration>().unwrap().as_secs(), 43_200);
        assert_eq!("7d".parse::<HumanDuration>().unwrap().as_secs(), 604_800);
        assert_eq!("2w".parse::<HumanDuration>().unwrap().as_secs(), 1_209_600);
        assert_eq!("1d12h".parse::<HumanDuration>().unwrap().as_secs(), 129_600);
        assert_eq!("3600".parse::<HumanDuration>().unwrap().as_secs(), 3_600);
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<HumanDuration>().is_err());
        assert!("5y".parse::<HumanDuration>().is_err());
        assert!("1d5".parse::<HumanDuration>().is_err());
        assert!("d".parse::<HumanDuration>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(HumanDuration::from_secs(129_600).to_string(), "1d12h");
        assert_eq!(HumanDuration::from_secs(61).to_string(), "1m1s");
        assert_eq!(HumanDuration::from_secs(0).to_string(), "0s");
    }

    #[test]
    fn test_deserialize_int_or_string() {
        #[derive(Deserialize)]
        struct T {
            a: HumanDuration,
            b: HumanDuration,
        }
        let t: T = toml::from_str("a = 60\nb = \"1h\"").unwrap();
        assert_eq!(t.a.as_secs(), 60);
        assert_eq!(t.b.as_secs(), 3_600);
    }
}
