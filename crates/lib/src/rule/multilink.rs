//! CP/M-65 relocatable binaries from three links of one program.
//!
//! The program is linked at its base address (`core`), with zero page shifted
//! (`zp`) and with memory shifted (`mem`). Bytes that differ between `core`
//! and a shifted link need relocating. Their positions are stored as deltas in
//! a nibble stream (`0xE` skips 14 without marking, `0xF` ends the stream)
//! appended after the code, zero-page table first.

use super::toolchain::ToolchainError;

const SKIP: u8 = 0xE;
const END: u8 = 0xF;

/// Positions where `a` and `b` differ.
fn differences(a: &[u8], b: &[u8]) -> Vec<usize> {
  a.iter()
    .zip(b)
    .enumerate()
    .filter(|(_, (x, y))| x != y)
    .map(|(pos, _)| pos)
    .collect()
}

/// Encode positions as a nibble-packed delta stream, high nibble first.
pub fn encode_deltas(positions: &[usize]) -> Vec<u8> {
  let mut nibbles = Vec::new();
  let mut last = 0;
  for &pos in positions {
    let mut delta = pos - last;
    while delta >= SKIP as usize {
      nibbles.push(SKIP);
      delta -= SKIP as usize;
    }
    nibbles.push(delta as u8);
    last = pos;
  }
  nibbles.push(END);

  nibbles
    .chunks(2)
    .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
    .collect()
}

/// Combine the three links into one relocatable binary.
pub fn multilink(core: &[u8], zp: &[u8], mem: &[u8]) -> Result<Vec<u8>, ToolchainError> {
  for (label, other) in [("zero-page", zp), ("memory", mem)] {
    if other.len() != core.len() {
      return Err(ToolchainError::Link(format!(
        "core and {} links differ in size ({} vs {} bytes)",
        label,
        core.len(),
        other.len()
      )));
    }
  }
  if core.len() < 4 {
    return Err(ToolchainError::Link(format!(
      "a {}-byte program has no room for its header",
      core.len()
    )));
  }
  if core.len() > 0x10000 {
    return Err(ToolchainError::Link(format!(
      "a {}-byte program does not fit 64K",
      core.len()
    )));
  }

  let zp_diffs = differences(core, zp);
  let mem_diffs = differences(core, mem);
  let zp_table = encode_deltas(&zp_diffs);
  let mem_table = encode_deltas(&mem_diffs);

  let mut out = core.to_vec();
  for &pos in &mem_diffs {
    out[pos] = out[pos].wrapping_sub(2);
  }

  let relo_size = zp_table.len() + 1 + mem_table.len();
  let rel_offset = u16::from_le_bytes([out[2], out[3]]) as usize;
  let pages = (rel_offset + relo_size).div_ceil(256);
  let tpa = (out[1] as usize).max(pages);
  out[1] = u8::try_from(tpa).map_err(|_| {
    ToolchainError::Link(format!(
      "program needs {} pages of TPA including relocation data",
      tpa
    ))
  })?;

  out.extend_from_slice(&zp_table);
  out.extend_from_slice(&mem_table);
  Ok(out)
}
