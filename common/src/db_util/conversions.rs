//! Checked conversions between rust and sql integer types.

pub fn i32_to_u32(i: i32) -> Result<u32, String> {
    if i < 0 {
        Err("i32 value is negative and cannot be converted to u32".to_string())
    } else {
        Ok(i as u32)
    }
}
pub fn u32_to_i32(i: u32) -> Result<i32, String> {
    if i > i32::MAX as u32 {
        Err("u32 value exceeds i32::MAX and cannot be converted to i32".to_string())
    } else {
        Ok(i as i32)
    }
}

pub fn i64_to_u64(i: i64) -> Result<u64, String> {
    if i < 0 {
        Err("i64 value is negative and cannot be converted to u64".to_string())
    } else {
        Ok(i as u64)
    }
}
