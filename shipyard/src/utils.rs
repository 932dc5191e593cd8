//! Utility functions

use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Version information for the platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Cooldown options for exponential backoff
#[derive(Debug, Clone)]
pub struct CooldownOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for CooldownOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Calculate exponential backoff delay
pub fn calc_exp_backoff(options: &CooldownOptions, attempt: u32) -> Duration {
    let delay_secs = options.base_delay.as_secs_f64() * options.multiplier.powi(attempt as i32);
    let capped_delay = delay_secs.min(options.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped_delay)
}

const ADJECTIVES: &[&str] = &[
    "amber", "ancient", "autumn", "billowing", "bitter", "black", "blue", "bold", "brave",
    "breezy", "bright", "broad", "calm", "cold", "cool", "crimson", "curly", "damp", "dark",
    "dawn", "delicate", "divine", "dry", "empty", "falling", "fancy", "flat", "floral",
    "fragrant", "frosty", "gentle", "green", "hidden", "holy", "icy", "jolly", "late",
    "lingering", "little", "lively", "long", "lucky", "misty", "morning", "muddy", "mute",
    "nameless", "noisy", "odd", "old", "orange", "patient", "plain", "polished", "proud",
    "purple", "quiet", "rapid", "raspy", "red", "restless", "rough", "round", "royal",
    "shiny", "shy", "silent", "small", "snowy", "soft", "solitary", "sparkling", "spring",
    "square", "steep", "still", "summer", "sweet", "swift", "tight", "tiny", "twilight",
    "wandering", "weathered", "white", "wild", "winter", "wispy", "withered", "young",
];

const NOUNS: &[&str] = &[
    "art", "band", "bar", "base", "bird", "block", "boat", "bonus", "bread", "breeze",
    "brook", "bush", "butterfly", "cake", "cell", "cherry", "cloud", "credit", "darkness",
    "dawn", "dew", "disk", "dream", "dust", "feather", "field", "fire", "firefly", "flower",
    "fog", "forest", "frog", "frost", "glade", "glitter", "grass", "hall", "hat", "haze",
    "heart", "hill", "king", "lab", "lake", "leaf", "limit", "math", "meadow", "mode",
    "moon", "morning", "mountain", "mouse", "mud", "night", "paper", "pine", "poetry",
    "pond", "queen", "rain", "recipe", "resonance", "rice", "river", "salad", "scene",
    "sea", "shadow", "shape", "silence", "sky", "smoke", "snow", "snowflake", "sound",
    "star", "sun", "sunset", "surf", "term", "thunder", "tooth", "tree", "truth", "union",
    "unit", "violet", "voice", "water", "waterfall", "wave", "wildflower", "wind", "wood",
];

/// Random `adjective-adjective-noun` subdomain
pub fn generate_slug() -> String {
    let mut rng = rand::thread_rng();
    let pick = |words: &[&'static str], rng: &mut rand::rngs::ThreadRng| -> &'static str {
        words.choose(rng).copied().unwrap_or("site")
    };
    let first = pick(ADJECTIVES, &mut rng);
    let second = pick(ADJECTIVES, &mut rng);
    let noun = pick(NOUNS, &mut rng);
    format!("{}-{}-{}", first, second, noun)
}

/// A subdomain must be one DNS label: `[a-z0-9-]{1,63}`, no hyphen at either end
pub fn is_valid_subdomain(subdomain: &str) -> bool {
    !subdomain.is_empty()
        && subdomain.len() <= 63
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}
