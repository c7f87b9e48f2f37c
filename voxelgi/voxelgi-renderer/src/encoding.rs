//! Fixed-point colour encoding shared by the voxelize (encode) and resolve (decode) programs.
//!
//! Storage buffers only support integer atomics, so each fragment adds
//! `round(clamp(c, 0, MAX_ENCODED_CHANNEL) * FIXED_POINT_SCALE)` per channel into a `vec4<u32>`
//! accumulation entry and increments a `u32` counter. Resolve divides the sum by
//! `count * FIXED_POINT_SCALE`. Sums wrap on overflow, so one voxel can absorb at most
//! `u32::MAX / (MAX_ENCODED_CHANNEL * FIXED_POINT_SCALE)` full-intensity samples.
//!
//! Bump `ENCODING_VERSION` whenever the scale, clamp or layout changes; the WGSL side is
//! generated from these constants by [`wgsl_prelude`].

/// Version of the accumulation layout and fixed-point scale.
pub const ENCODING_VERSION: u32 = 1;
/// 10 fractional bits.
pub const FIXED_POINT_SCALE: f32 = 1024.0;
pub const MAX_ENCODED_CHANNEL: f32 = 64.0;

/// Bytes per accumulation entry (`vec4<u32>`).
pub const ACCUMULATION_STRIDE: u64 = 16;
/// Bytes per counter entry (`u32`).
pub const COUNT_STRIDE: u64 = 4;
/// Bytes per resolved entry (`vec4<f32>`).
pub const RESOLVED_STRIDE: u64 = 16;
/// Bytes per octree node (`OctreeNode`).
pub const OCTREE_NODE_STRIDE: u64 = 32;
/// Bytes per index buffer entry.
pub const INDEX_STRIDE: u64 = 4;

/// Largest number of samples at `MAX_ENCODED_CHANNEL` that fit before a channel wraps.
pub fn max_full_intensity_samples() -> u32 {
    (u32::MAX as f64 / (MAX_ENCODED_CHANNEL as f64 * FIXED_POINT_SCALE as f64)) as u32
}

#[inline]
pub fn encode_channel(c: f32) -> u32 {
    let c = if c.is_nan() { 0.0 } else { c.clamp(0.0, MAX_ENCODED_CHANNEL) };
    (c * FIXED_POINT_SCALE).round() as u32
}

#[inline]
pub fn encode_color(c: [f32; 4]) -> [u32; 4] {
    [encode_channel(c[0]), encode_channel(c[1]), encode_channel(c[2]), encode_channel(c[3])]
}

/// Average of `count` encoded samples, or zero when the voxel received nothing.
#[inline]
pub fn decode_average(sum: [u32; 4], count: u32) -> [f32; 4] {
    if count == 0 {
        return [0.0; 4];
    }
    let denom = count as f32 * FIXED_POINT_SCALE;
    [sum[0] as f32 / denom, sum[1] as f32 / denom, sum[2] as f32 / denom, sum[3] as f32 / denom]
}

/// Worst-case absolute error of one decoded channel.
pub fn decode_tolerance() -> f32 {
    0.5 / FIXED_POINT_SCALE + f32::EPSILON * MAX_ENCODED_CHANNEL
}

/// WGSL constants and helpers prepended to every bundled program.
pub fn wgsl_prelude() -> String {
    format!(
        "// voxel colour encoding v{version}\n\
         const ENCODING_VERSION: u32 = {version}u;\n\
         const FIXED_POINT_SCALE: f32 = {scale:.1};\n\
         const MAX_ENCODED_CHANNEL: f32 = {max:.1};\n\
         fn encode_color(c: vec4<f32>) -> vec4<u32> {{\n\
         \x20   return vec4<u32>(floor(clamp(c, vec4<f32>(0.0), vec4<f32>(MAX_ENCODED_CHANNEL)) * FIXED_POINT_SCALE + 0.5));\n\
         }}\n\
         fn decode_average(sum: vec4<u32>, count: u32) -> vec4<f32> {{\n\
         \x20   if (count == 0u) {{ return vec4<f32>(0.0); }}\n\
         \x20   return vec4<f32>(sum) / (f32(count) * FIXED_POINT_SCALE);\n\
         }}\n",
        version = ENCODING_VERSION,
        scale = FIXED_POINT_SCALE,
        max = MAX_ENCODED_CHANNEL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_clamps_and_rounds() {
        assert_eq!(encode_channel(0.0), 0);
        assert_eq!(encode_channel(1.0), 1024);
        assert_eq!(encode_channel(-3.0), 0);
        assert_eq!(encode_channel(f32::NAN), 0);
        assert_eq!(encode_channel(1000.0), (MAX_ENCODED_CHANNEL * FIXED_POINT_SCALE) as u32);
        assert_eq!(encode_channel(0.5 / 1024.0), 1);
    }

    #[test]
    fn average_of_repeated_samples_matches_input() {
        let c = [0.8, 0.25, 0.1, 1.0];
        let e = encode_color(c);
        let n = 37u32;
        let sum = [e[0] * n, e[1] * n, e[2] * n, e[3] * n];
        let avg = decode_average(sum, n);
        for k in 0..4 {
            assert!((avg[k] - c[k]).abs() <= decode_tolerance(), "channel {}: {} vs {}", k, avg[k], c[k]);
        }
    }

    #[test]
    fn zero_count_decodes_to_zero() {
        assert_eq!(decode_average([123, 4, 5, 6], 0), [0.0; 4]);
    }

    #[test]
    fn full_intensity_budget_does_not_wrap() {
        let n = max_full_intensity_samples() as u64;
        let per = encode_channel(MAX_ENCODED_CHANNEL) as u64;
        assert!(n * per <= u32::MAX as u64);
        assert!((n + 1) * per > u32::MAX as u64);
    }

    #[test]
    fn prelude_carries_rust_constants() {
        let src = wgsl_prelude();
        assert!(src.contains("const FIXED_POINT_SCALE: f32 = 1024.0;"));
        assert!(src.contains("const MAX_ENCODED_CHANNEL: f32 = 64.0;"));
        assert!(src.contains(&format!("const ENCODING_VERSION: u32 = {}u;", ENCODING_VERSION)));
        assert!(src.contains("fn encode_color"));
        assert!(src.contains("fn decode_average"));
    }
}
