/// Compare an actual status word against the expected one.
///
/// Exact string equality after upper-casing both sides; no numeric
/// interpretation, no prefixes, no wildcards.
pub fn verify(actual_sw_hex: &str, expected_sw_hex: &str) -> bool {
    actual_sw_hex.to_uppercase() == expected_sw_hex.to_uppercase()
}
