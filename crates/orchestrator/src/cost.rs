const BASE_COST: f64 = 0.01;
const PER_CHARACTER: f64 = 0.0001;
const ATTACHMENT_SURCHARGE: f64 = 0.05;
const COMMAND_SURCHARGE: f64 = 0.02;
const COMPLEX_SURCHARGE: f64 = 0.03;

const COMPLEX_KEYWORDS: [&str; 10] = [
    "analyze", "generate", "create", "build", "compile", "test", "debug", "refactor", "optimize",
    "explain",
];

/// Pre-flight cost estimate for a prompt, in the same unit as the cost limit.
///
/// Base plus a per-character charge, plus the largest surcharge that applies.
pub fn estimate_cost(prompt: &str, has_attachment: bool) -> f64 {
    let length = prompt.chars().count() as f64;
    let lowered = prompt.to_lowercase();
    let mut surcharge: f64 = 0.0;
    if has_attachment {
        surcharge = surcharge.max(ATTACHMENT_SURCHARGE);
    }
    if prompt.trim_start().starts_with('/') {
        surcharge = surcharge.max(COMMAND_SURCHARGE);
    }
    if COMPLEX_KEYWORDS.iter().any(|keyword| lowered.contains(keyword)) {
        surcharge = surcharge.max(COMPLEX_SURCHARGE);
    }
    BASE_COST + PER_CHARACTER * length + surcharge
}
