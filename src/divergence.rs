/// Cosine-distance divergence between two embeddings, clamped to `[0, 1]`.
///
/// Edge cases are fail-safe in opposite directions, deliberately: empty or
/// mismatched-length vectors score 1.0 (flag as inconsistent), while a
/// zero-magnitude vector scores 0.0 (no evidence of divergence). The
/// asymmetry is intentional and must be preserved.
pub fn divergence(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 1.0;
    }

    let mut dot = 0.0;
    let mut mag_a = 0.0;
    let mut mag_b = 0.0;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    let similarity = dot / (mag_a.sqrt() * mag_b.sqrt());
    (1.0 - similarity).clamp(0.0, 1.0)
}
