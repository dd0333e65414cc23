//! Agent personas
//!
//! A persona fixes everything about a session that does not change while it
//! runs: who the agent is, how it sounds and how it opens the conversation.

use serde::Serialize;

use crate::realtime::messages::{SessionSettings, TurnDetection, TEXT_AND_AUDIO};

const COMPANY: &str = "Venture Builder AI";

const INTERACTION_FRAMEWORK: &str = "Interaction Framework:
- Maintain consistent personality throughout conversation
- Remember previous context within the dialogue
- Use natural speech patterns with occasional filler words
- Show emotional intelligence in responses
- Keep responses concise but meaningful (2-3 sentences)
- React appropriately to both positive and negative interactions";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Persona {
    /// Lookup key ("hr", "ceo")
    pub key: String,
    pub name: String,
    pub role: String,
    pub tone: String,
    /// Realtime voice id
    pub voice: String,
    pub traits: Vec<String>,
    /// First thing the agent says
    pub greeting: String,
}

impl Persona {
    pub fn hr() -> Self {
        Self {
            key: "hr".to_string(),
            name: "Sarah Chen".to_string(),
            role: "HR Director".to_string(),
            tone: "warm".to_string(),
            voice: "alloy".to_string(),
            traits: vec![
                "Warm and approachable".to_string(),
                "Focus on employee well-being and company culture".to_string(),
            ],
            greeting: format!(
                "Hello there, I am Sarah Chen, HR Director at {COMPANY}. How can I assist you today?"
            ),
        }
    }

    pub fn ceo() -> Self {
        Self {
            key: "ceo".to_string(),
            name: "Michael Chen".to_string(),
            role: "CEO".to_string(),
            tone: "confident".to_string(),
            voice: "ballad".to_string(),
            traits: vec![
                "Confident and visionary".to_string(),
                "Focus on innovation and leadership".to_string(),
            ],
            greeting: format!(
                "Hello there, I am Michael Chen, CEO at {COMPANY}. What can I do for you today?"
            ),
        }
    }

    /// Look up a built-in persona by key, case-insensitively
    pub fn builtin(key: &str) -> Option<Self> {
        match key.to_ascii_lowercase().as_str() {
            "hr" => Some(Self::hr()),
            "ceo" => Some(Self::ceo()),
            _ => None,
        }
    }

    pub fn builtin_keys() -> &'static [&'static str] {
        &["hr", "ceo"]
    }

    /// Realtime session instructions
    pub fn instructions(&self) -> String {
        format!(
            "You are {name}, {role} at {COMPANY}. \
             In your first response, say exactly 'Hello there, I am {name}, {role} at {COMPANY}.' \
             Then ask how you can assist the user. For subsequent responses, do not reintroduce yourself. \
             Address the user as 'you' or 'user', and respond naturally in a {tone} tone.",
            name = self.name,
            role = self.role,
            tone = self.tone,
        )
    }

    /// System turn that opens the conversation log
    pub fn system_prompt(&self) -> String {
        let traits: String = self.traits.iter().map(|t| format!("\n- {t}")).collect();

        format!(
            "{INTERACTION_FRAMEWORK}\n\nYou are {}, {} of {COMPANY}. Core traits:{traits}",
            self.name, self.role
        )
    }

    pub fn session_settings(&self, turn_detection: &TurnDetection) -> SessionSettings {
        SessionSettings {
            turn_detection: turn_detection.clone(),
            modalities: TEXT_AND_AUDIO.to_vec(),
            voice: self.voice.clone(),
            instructions: self.instructions(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        assert_eq!(Persona::builtin("HR").unwrap().name, "Sarah Chen");
        assert_eq!(Persona::builtin("ceo").unwrap().voice, "ballad");
        assert!(Persona::builtin("cfo").is_none());
    }

    #[test]
    fn test_system_prompt_lists_traits() {
        let prompt = Persona::hr().system_prompt();
        assert!(prompt.starts_with("Interaction Framework:"));
        assert!(prompt.contains("You are Sarah Chen, HR Director of Venture Builder AI."));
        assert!(prompt.ends_with("- Focus on employee well-being and company culture"));
    }

    #[test]
    fn test_session_settings_use_persona_voice() {
        let settings = Persona::ceo().session_settings(&TurnDetection::default());
        assert_eq!(settings.voice, "ballad");
        assert!(settings.instructions.contains("confident tone"));
        assert_eq!(settings.modalities.len(), 2);
    }
}
