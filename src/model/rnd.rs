use rand::Rng;

/// Generate a buffer of cryptographically secure random bytes,
/// used for salts, IVs and the generated hardware id
pub fn random(size: usize) -> Vec<u8> {
    let mut result = vec![0; size];
    rand::thread_rng().fill(result.as_mut_slice());
    result
}
