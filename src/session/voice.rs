use serde::{Deserialize, Serialize};

/// Prebuilt voice persona for the remote speaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Voice {
    Puck,
    Charon,
    #[default]
    Kore,
    Fenrir,
    Aoede,
}

impl Voice {
    pub const ALL: [Voice; 5] = [
        Voice::Puck,
        Voice::Charon,
        Voice::Kore,
        Voice::Fenrir,
        Voice::Aoede,
    ];

    /// Name as understood by the service
    pub fn as_str(&self) -> &'static str {
        match self {
            Voice::Puck => "Puck",
            Voice::Charon => "Charon",
            Voice::Kore => "Kore",
            Voice::Fenrir => "Fenrir",
            Voice::Aoede => "Aoede",
        }
    }
}

impl std::fmt::Display for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Voice {
    type Err = String;

    /// Case-insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Voice::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let names: Vec<&str> = Voice::ALL.iter().map(|v| v.as_str()).collect();
                format!("Unknown voice '{}' (expected one of {})", s, names.join(", "))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("kore".parse::<Voice>(), Ok(Voice::Kore));
        assert_eq!(" FENRIR ".parse::<Voice>(), Ok(Voice::Fenrir));
        assert_eq!("Aoede".parse::<Voice>(), Ok(Voice::Aoede));
    }

    #[test]
    fn test_parse_unknown_lists_choices() {
        let err = "Zephyr".parse::<Voice>().unwrap_err();
        assert!(err.contains("Zephyr"));
        assert!(err.contains("Puck"));
    }

    #[test]
    fn test_serde_uses_service_names() {
        assert_eq!(serde_json::to_string(&Voice::Charon).unwrap(), "\"Charon\"");
        let voice: Voice = serde_json::from_str("\"Puck\"").unwrap();
        assert_eq!(voice, Voice::Puck);
    }

    #[test]
    fn test_default_is_kore() {
        assert_eq!(Voice::default(), Voice::Kore);
        assert_eq!(Voice::default().to_string(), "Kore");
    }
}
