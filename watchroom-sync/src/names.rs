//! Display names and chat avatars.

use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "Quick", "Lazy", "Sleepy", "Happy", "Funny", "Crazy", "Angry", "Sunny", "Blue", "Red",
    "Green", "Flying", "Silent", "Wise", "Brave", "Kind",
];

const NOUNS: &[&str] = &[
    "Fox", "Dog", "Cat", "Panda", "Tiger", "Lion", "Bear", "Wolf", "Eagle", "Shark", "Snake",
    "Rabbit", "Mango", "Apple", "Kiwi", "Pizza",
];

/// Sender name used for join/leave notices.
pub const SYSTEM_USER: &str = "System";

/// "Adjective Noun", e.g. "Sleepy Panda".
pub fn random_display_name() -> String {
    let mut rng = rand::thread_rng();
    let adj = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("Viewer");
    format!("{adj} {noun}")
}

/// Upper-cased first character of the name.
pub fn avatar_for(name: &str) -> String {
    name.trim()
        .chars()
        .next()
        .map(|c| c.to_uppercase().collect())
        .unwrap_or_else(|| "?".to_string())
}
