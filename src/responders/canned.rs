use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::error::Result;
use crate::interfaces::generator::ResponseGenerator;
use crate::ledger::ContextTurn;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did", "will", "would",
    "could", "should", "may", "might", "can", "must",
];

const GREETINGS: &[&str] = &["hello", "hi", "hey", "good morning", "good afternoon", "good evening"];
const TIME_WORDS: &[&str] = &["time", "clock"];
const DATE_WORDS: &[&str] = &["date", "today", "day"];
const THANKS: &[&str] = &["thank", "thanks", "appreciate"];
const GOODBYES: &[&str] = &["bye", "goodbye", "see you", "farewell"];
const TASK_WORDS: &[&str] = &["do", "make", "create", "write", "generate"];

/// Offline, rule-based replies. Used when no model backend is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct CannedResponder;

impl CannedResponder {
    pub fn new() -> Self {
        Self
    }

    pub fn reply_at(&self, message: &str, now: DateTime<Local>) -> String {
        let lowered = message.trim().to_lowercase();
        let words = Words::new(&lowered);

        if words.mentions_any(GREETINGS) {
            return "Hello! How may I assist you today?".to_string();
        }
        if words.mentions_any(TIME_WORDS) {
            return format!("Current time: {}", now.format("%H:%M:%S"));
        }
        if words.mentions_any(DATE_WORDS) {
            return format!("Today is {}", now.format("%A, %B %d, %Y"));
        }
        if words.mentions("weather") {
            return "Please check your local weather service for current conditions.".to_string();
        }
        if lowered.starts_with("/help") || words.mentions("help") {
            return "Available: /time, /date, /help\nAsk questions or give commands for assistance."
                .to_string();
        }
        if lowered.ends_with('?') {
            if message.chars().count() < 20 {
                return "Could you provide more details about your question?".to_string();
            }
            return format!(
                "I understand your question about {}.\nHow can I help you with this?",
                extract_topic(message)
            );
        }
        if words.mentions_any(THANKS) {
            return "You're welcome! Anything else I can help with?".to_string();
        }
        if words.mentions_any(GOODBYES) {
            return "Goodbye! Have a great day!".to_string();
        }
        if words.mentions_any(TASK_WORDS) {
            return "I'll help you with that task.\nPlease provide specific details about what you need."
                .to_string();
        }

        let topic = extract_topic(message);
        if message.chars().count() > 50 {
            format!("I've received your message about {topic}.\nHow would you like me to proceed?")
        } else {
            format!("Regarding {topic} - what specific assistance do you need?")
        }
    }

    fn is_clock_query(&self, message: &str) -> bool {
        let lowered = message.trim().to_lowercase();
        let words = Words::new(&lowered);
        !words.mentions_any(GREETINGS)
            && (words.mentions_any(TIME_WORDS) || words.mentions_any(DATE_WORDS))
    }
}

#[async_trait]
impl ResponseGenerator for CannedResponder {
    fn name(&self) -> &str {
        "canned"
    }

    fn cacheable(&self, query: &str) -> bool {
        !self.is_clock_query(query)
    }

    async fn generate(
        &self,
        query: &str,
        _context: &[ContextTurn],
        _conversation_id: &str,
    ) -> Result<String> {
        Ok(self.reply_at(query, Local::now()))
    }
}

/// Up to three significant words of `message`, or "your request".
pub fn extract_topic(message: &str) -> String {
    let cleaned = message
        .to_lowercase()
        .replace(['?', '.', ','], "");
    let key_words: Vec<&str> = cleaned
        .split_whitespace()
        .filter(|word| !STOP_WORDS.contains(word) && word.chars().count() > 2)
        .take(3)
        .collect();
    if key_words.is_empty() {
        "your request".to_string()
    } else {
        key_words.join(" ")
    }
}

/// Whole-word matching over a lowercased message, so "hi" does not fire on
/// "this" and "day" does not fire on "monday".
struct Words {
    padded: String,
}

impl Words {
    fn new(lowered: &str) -> Self {
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|token| !token.is_empty())
            .collect();
        Self {
            padded: format!(" {} ", tokens.join(" ")),
        }
    }

    fn mentions(&self, phrase: &str) -> bool {
        self.padded.contains(&format!(" {phrase} "))
    }

    fn mentions_any(&self, phrases: &[&str]) -> bool {
        phrases.iter().any(|phrase| self.mentions(phrase))
    }
}
