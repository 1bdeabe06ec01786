//! Offensive-word blocklist for generated subdomains. Consulted both
//! at allocation time and again on every visitor request, so rows that
//! predate a list change still stop serving.

const BLOCKED_WORDS: &[&str] = &[
    "anal", "arse", "bitch", "cock", "coon", "cunt", "dick", "fag", "fuck",
    "jizz", "kike", "nazi", "nigg", "porn", "pube", "rape", "sex", "shit",
    "slut", "spic", "tits", "twat", "wank",
];

/// True when the subdomain contains any blocklisted word.
pub fn is_subdomain_blocked(subdomain: &str) -> bool {
    let lower = subdomain.to_ascii_lowercase();
    BLOCKED_WORDS.iter().any(|word| lower.contains(word))
}
