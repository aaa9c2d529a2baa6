//! Emulated device memory and texel operations.
//!
//! Every buffer and texture subresource lives in one budgeted [`MemoryArena`].
//! Buffers that ask for a device address get a slot in a sparse, never reused
//! address space, so stale addresses fault instead of aliasing new memory.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::arena::{ArenaBlock, MemoryArena};
use crate::backend::{DeviceAddress, NativeHandle};
use crate::command::ClearValue;
use crate::error::{GalError, GalResult};
use crate::format::TextureFormat;

/// First emulated device address. Zero is never handed out.
pub(crate) const ADDRESS_BASE: DeviceAddress = 0x1_0000_0000;
/// Alignment of every emulated device address.
pub(crate) const ADDRESS_ALIGNMENT: u64 = 256;

struct AddressSpace {
    next: DeviceAddress,
    /// Base address to (buffer, size).
    ranges: BTreeMap<DeviceAddress, (NativeHandle, u64)>,
}

pub(crate) struct DeviceMemory {
    arena: MemoryArena,
    addresses: Mutex<AddressSpace>,
}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("live_bytes", &self.arena.live_bytes())
            .finish_non_exhaustive()
    }
}

impl DeviceMemory {
    pub fn new(budget: u64) -> Self {
        Self {
            arena: MemoryArena::with_budget("headless device memory", budget),
            addresses: Mutex::new(AddressSpace {
                next: ADDRESS_BASE,
                ranges: BTreeMap::new(),
            }),
        }
    }

    pub fn arena(&self) -> &MemoryArena {
        &self.arena
    }

    pub fn allocate(&self, len: u64) -> GalResult<ArenaBlock> {
        self.arena.allocate(len)
    }

    pub fn release(&self, block: ArenaBlock) {
        self.arena.release(block);
    }

    /// Reserves an address range for `buffer`.
    pub fn map_address(&self, buffer: NativeHandle, size: u64) -> DeviceAddress {
        let mut space = self.lock();
        let address = space.next;
        space.next = (address + size.max(1)).next_multiple_of(ADDRESS_ALIGNMENT);
        space.ranges.insert(address, (buffer, size));
        address
    }

    pub fn unmap_address(&self, address: DeviceAddress) {
        self.lock().ranges.remove(&address);
    }

    /// Finds the buffer holding `len` bytes at `address`; returns it with the
    /// offset of `address` inside it.
    pub fn resolve(&self, address: DeviceAddress, len: u64) -> GalResult<(NativeHandle, u64)> {
        let space = self.lock();
        let fault = || {
            GalError::Backend(format!(
                "device address {address:#x}+{len} is not inside a live buffer"
            ))
        };
        let (&base, &(buffer, size)) = space.ranges.range(..=address).next_back().ok_or_else(fault)?;
        let offset = address - base;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(fault());
        }
        Ok((buffer, offset))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AddressSpace> {
        self.addresses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One contiguous row run of a region copy: texture byte offset, packed region
/// byte offset and length.
pub(crate) type RowSpan = (usize, usize, usize);

/// Splits a region of a tightly packed subresource into rows.
pub(crate) fn region_rows(
    full: [u32; 3],
    origin: [u32; 3],
    extent: [u32; 3],
    texel: u32,
) -> Vec<RowSpan> {
    let texel = texel as usize;
    let [w, h, _] = full.map(|v| v as usize);
    let [ox, oy, oz] = origin.map(|v| v as usize);
    let [ew, eh, ed] = extent.map(|v| v as usize);
    let mut rows = Vec::with_capacity(eh * ed);
    for z in 0..ed {
        for y in 0..eh {
            let texture = (((oz + z) * h + oy + y) * w + ox) * texel;
            let packed = (z * eh + y) * ew * texel;
            rows.push((texture, packed, ew * texel));
        }
    }
    rows
}

/// Encodes a clear value as one texel of `format`.
pub(crate) fn encode_clear(format: TextureFormat, clear: ClearValue) -> Vec<u8> {
    match clear {
        ClearValue::Color(color) => encode_color(format, color),
        ClearValue::DepthStencil { depth, stencil } => match format {
            TextureFormat::D32Float => depth.to_le_bytes().to_vec(),
            TextureFormat::D24UnormS8Uint => {
                let depth = (depth.clamp(0.0, 1.0) * 0xFF_FFFF as f32).round() as u32;
                (depth | (stencil & 0xFF) << 24).to_le_bytes().to_vec()
            }
            TextureFormat::D32FloatS8Uint => {
                let mut texel = depth.to_le_bytes().to_vec();
                texel.extend_from_slice(&(stencil & 0xFF).to_le_bytes());
                texel
            }
            other => vec![0; other.bytes_per_texel() as usize],
        },
    }
}

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn encode_color(format: TextureFormat, [r, g, b, a]: [f32; 4]) -> Vec<u8> {
    let floats = |channels: &[f32]| -> Vec<u8> {
        channels.iter().flat_map(|c| c.to_le_bytes()).collect()
    };
    let halves = |channels: &[f32]| -> Vec<u8> {
        channels
            .iter()
            .flat_map(|&c| f32_to_f16(c).to_le_bytes())
            .collect()
    };
    match format {
        TextureFormat::R8Unorm => vec![unorm8(r)],
        TextureFormat::Rg8Unorm => vec![unorm8(r), unorm8(g)],
        TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => {
            vec![unorm8(r), unorm8(g), unorm8(b), unorm8(a)]
        }
        TextureFormat::Bgra8Unorm | TextureFormat::Bgra8UnormSrgb => {
            vec![unorm8(b), unorm8(g), unorm8(r), unorm8(a)]
        }
        TextureFormat::R16Float => halves(&[r]),
        TextureFormat::Rg16Float => halves(&[r, g]),
        TextureFormat::Rgba16Float => halves(&[r, g, b, a]),
        TextureFormat::R32Uint => (r.max(0.0) as u32).to_le_bytes().to_vec(),
        TextureFormat::R32Float => floats(&[r]),
        TextureFormat::Rg32Float => floats(&[r, g]),
        TextureFormat::Rgba32Float => floats(&[r, g, b, a]),
        depth => vec![0; depth.bytes_per_texel() as usize],
    }
}

/// Round-to-nearest-even conversion to IEEE half precision.
pub(crate) fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xFF) as i32;
    let mantissa = bits & 0x7F_FFFF;
    if exponent == 0xFF {
        let nan = if mantissa != 0 { 0x200 } else { 0 };
        return sign | 0x7C00 | nan;
    }
    let half_exponent = exponent - 127 + 15;
    if half_exponent >= 0x1F {
        return sign | 0x7C00;
    }
    if half_exponent <= 0 {
        if half_exponent < -10 {
            return sign;
        }
        let mantissa = mantissa | 0x80_0000;
        let shift = (14 - half_exponent) as u32;
        let half = mantissa >> shift;
        let rest = mantissa & ((1 << shift) - 1);
        let halfway = 1 << (shift - 1);
        let round = rest > halfway || (rest == halfway && half & 1 == 1);
        return sign | (half + round as u32) as u16;
    }
    let half = ((half_exponent as u32) << 10) | (mantissa >> 13);
    let rest = mantissa & 0x1FFF;
    let round = rest > 0x1000 || (rest == 0x1000 && half & 1 == 1);
    sign | (half + round as u32) as u16
}

pub(crate) fn f16_to_f32(half: u16) -> f32 {
    let sign = ((half as u32) & 0x8000) << 16;
    let exponent = ((half >> 10) & 0x1F) as u32;
    let mantissa = (half & 0x3FF) as u32;
    let bits = match (exponent, mantissa) {
        (0, 0) => sign,
        (0, _) => {
            // Subnormal: normalise into an f32 exponent.
            let mut e = 127 - 15 + 1;
            let mut m = mantissa;
            while m & 0x400 == 0 {
                m <<= 1;
                e -= 1;
            }
            sign | (e as u32) << 23 | (m & 0x3FF) << 13
        }
        (0x1F, _) => sign | 0x7F80_0000 | mantissa << 13,
        _ => sign | (exponent + 127 - 15) << 23 | mantissa << 13,
    };
    f32::from_bits(bits)
}

/// How texels of a format are averaged when downsampling.
#[derive(Clone, Copy)]
enum Channels {
    Unorm8,
    Float16,
    Float32,
    /// Formats without a meaningful average; the nearest texel is taken.
    Opaque,
}

fn channels(format: TextureFormat) -> Channels {
    match format {
        f if f.is_unorm8() => Channels::Unorm8,
        TextureFormat::R16Float | TextureFormat::Rg16Float | TextureFormat::Rgba16Float => {
            Channels::Float16
        }
        TextureFormat::R32Float | TextureFormat::Rg32Float | TextureFormat::Rgba32Float => {
            Channels::Float32
        }
        _ => Channels::Opaque,
    }
}

/// Box-filters one tightly packed mip level into the next.
pub(crate) fn downsample(
    src: &[u8],
    src_extent: [u32; 3],
    dst_extent: [u32; 3],
    format: TextureFormat,
) -> Vec<u8> {
    let texel = format.bytes_per_texel() as usize;
    let [sw, sh, sd] = src_extent.map(|v| v as usize);
    let [dw, dh, dd] = dst_extent.map(|v| v as usize);
    let mut out = vec![0u8; dw * dh * dd * texel];
    let index = |x: usize, y: usize, z: usize| ((z * sh + y) * sw + x) * texel;
    let kind = channels(format);
    for z in 0..dd {
        for y in 0..dh {
            for x in 0..dw {
                let dst = ((z * dh + y) * dw + x) * texel;
                let mut taps = Vec::with_capacity(8);
                for tz in [2 * z, 2 * z + 1] {
                    for ty in [2 * y, 2 * y + 1] {
                        for tx in [2 * x, 2 * x + 1] {
                            taps.push(index(tx.min(sw - 1), ty.min(sh - 1), tz.min(sd - 1)));
                        }
                    }
                }
                let texel_out = &mut out[dst..dst + texel];
                average(kind, src, &taps, texel, texel_out);
            }
        }
    }
    out
}

fn average(kind: Channels, src: &[u8], taps: &[usize], texel: usize, out: &mut [u8]) {
    let n = taps.len() as f32;
    match kind {
        Channels::Unorm8 => {
            for (c, byte) in out.iter_mut().enumerate() {
                let sum: u32 = taps.iter().map(|&t| src[t + c] as u32).sum();
                *byte = (sum as f32 / n).round() as u8;
            }
        }
        Channels::Float16 => {
            for c in (0..texel).step_by(2) {
                let sum: f32 = taps
                    .iter()
                    .map(|&t| f16_to_f32(u16::from_le_bytes([src[t + c], src[t + c + 1]])))
                    .sum();
                out[c..c + 2].copy_from_slice(&f32_to_f16(sum / n).to_le_bytes());
            }
        }
        Channels::Float32 => {
            for c in (0..texel).step_by(4) {
                let sum: f32 = taps
                    .iter()
                    .map(|&t| bytemuck::pod_read_unaligned::<f32>(&src[t + c..t + c + 4]))
                    .sum();
                out[c..c + 4].copy_from_slice(&(sum / n).to_le_bytes());
            }
        }
        Channels::Opaque => out.copy_from_slice(&src[taps[0]..taps[0] + texel]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_aligned_and_resolvable() {
        let memory = DeviceMemory::new(1 << 20);
        let a = memory.map_address(NativeHandle(1), 48);
        let b = memory.map_address(NativeHandle(2), 300);
        assert_eq!(a, ADDRESS_BASE);
        assert_eq!(b % ADDRESS_ALIGNMENT, 0);
        assert!(b >= a + 48);
        assert_eq!(memory.resolve(a + 12, 12).unwrap(), (NativeHandle(1), 12));
        assert_eq!(memory.resolve(b + 299, 1).unwrap(), (NativeHandle(2), 299));
        assert!(memory.resolve(a + 40, 12).is_err());
        memory.unmap_address(a);
        assert!(memory.resolve(a, 4).is_err());
    }

    #[test]
    fn region_rows_cover_a_sub_rectangle() {
        let rows = region_rows([4, 4, 1], [1, 2, 0], [2, 2, 1], 4);
        assert_eq!(rows, vec![(36, 0, 8), (52, 8, 8)]);
    }

    #[test]
    fn clear_values_follow_channel_order() {
        let clear = ClearValue::Color([1.0, 0.0, 0.5, 1.0]);
        assert_eq!(encode_clear(TextureFormat::Rgba8Unorm, clear), vec![255, 0, 128, 255]);
        assert_eq!(encode_clear(TextureFormat::Bgra8Unorm, clear), vec![128, 0, 255, 255]);
        let depth = ClearValue::DepthStencil {
            depth: 1.0,
            stencil: 0,
        };
        assert_eq!(encode_clear(TextureFormat::D32Float, depth), 1.0f32.to_le_bytes());
    }

    #[test]
    fn half_floats_round_trip_representable_values() {
        for value in [0.0f32, 1.0, -2.5, 0.5, 65504.0, 6.1035156e-5] {
            assert_eq!(f16_to_f32(f32_to_f16(value)), value);
        }
        assert_eq!(f32_to_f16(1.0), 0x3C00);
        assert_eq!(f32_to_f16(1e6), 0x7C00);
    }

    #[test]
    fn downsample_averages_unorm_quads() {
        let src = [0u8, 100, 50, 250];
        let out = downsample(&src, [2, 2, 1], [1, 1, 1], TextureFormat::R8Unorm);
        assert_eq!(out, vec![100]);
    }

    #[test]
    fn downsample_clamps_odd_edges() {
        let src: Vec<u8> = [1.0f32, 3.0, 5.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let out = downsample(&src, [3, 1, 1], [1, 1, 1], TextureFormat::R32Float);
        assert_eq!(bytemuck::pod_read_unaligned::<f32>(&out), 2.0);
    }
}
