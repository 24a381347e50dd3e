/// Derive the advisory lock id for a task name.
///
/// Classic `hash * 31 + unit` string hash over UTF-16 code units with 32-bit
/// wraparound, then the absolute value. Every process computes the same id for
/// the same name; collisions between distinct names are possible.
pub fn lock_id_for(task_name: &str) -> i64 {
    let hash = task_name
        .encode_utf16()
        .fold(0i32, |acc, unit| acc.wrapping_mul(31).wrapping_add(i32::from(unit)));
    // widen first so i32::MIN does not overflow
    i64::from(hash).abs()
}
