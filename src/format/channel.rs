//! Channel positions, default layouts, remixing and remapping.
//!
//! Frames are interleaved, so every operation here works frame-by-frame on
//! flat f32 runs. Remixing changes the channel *count* (dropping, averaging,
//! zero-filling or broadcasting); remapping permutes channel *positions*
//! within a frame according to a precomputed shuffle table.

/// Hard ceiling on the number of channels in a frame.
///
/// Every scratch buffer that holds one frame is sized by this constant, so
/// widening it means widening all of them together.
pub const MAX_CHANNELS: usize = 18;

/// A speaker position within a frame.
///
/// The discriminants are stable ids. `None` marks an unassigned slot; maps
/// made entirely of `None` mean "same layout as the device".
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Channel {
    /// Unassigned.
    #[default]
    None = 0,
    /// Front left.
    FrontLeft = 1,
    /// Front right.
    FrontRight = 2,
    /// Front center.
    FrontCenter = 3,
    /// Low-frequency effects.
    Lfe = 4,
    /// Back left.
    BackLeft = 5,
    /// Back right.
    BackRight = 6,
    /// Front left of center.
    FrontLeftCenter = 7,
    /// Front right of center.
    FrontRightCenter = 8,
    /// Back center.
    BackCenter = 9,
    /// Side left.
    SideLeft = 10,
    /// Side right.
    SideRight = 11,
    /// Top center.
    TopCenter = 12,
    /// Top front left.
    TopFrontLeft = 13,
    /// Top front center.
    TopFrontCenter = 14,
    /// Top front right.
    TopFrontRight = 15,
    /// Top back left.
    TopBackLeft = 16,
    /// Top back center.
    TopBackCenter = 17,
    /// Top back right.
    TopBackRight = 18,
}

impl Channel {
    /// Stable numeric id of this position.
    #[must_use]
    pub fn id(self) -> u8 {
        self as u8
    }
}

/// Returns the default channel map for a channel count.
///
/// Counts without a conventional layout get an all-`None` map, which devices
/// treat as "use whatever the endpoint reports".
#[must_use]
pub fn default_channel_map(channels: u16) -> Vec<Channel> {
    use Channel::{
        BackLeft, BackRight, FrontCenter, FrontLeft, FrontRight, Lfe, SideLeft, SideRight,
    };
    match channels {
        1 => vec![FrontCenter],
        2 => vec![FrontLeft, FrontRight],
        3 => vec![FrontLeft, FrontRight, Lfe],
        4 => vec![FrontLeft, FrontRight, BackLeft, BackRight],
        5 => vec![FrontLeft, FrontRight, BackLeft, BackRight, Lfe],
        6 => vec![FrontLeft, FrontRight, FrontCenter, Lfe, BackLeft, BackRight],
        8 => vec![
            FrontLeft,
            FrontRight,
            FrontCenter,
            Lfe,
            BackLeft,
            BackRight,
            SideLeft,
            SideRight,
        ],
        n => vec![Channel::None; usize::from(n)],
    }
}

/// How remixing fills or folds channels when the counts differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixMode {
    /// Copy overlapping channels; drop or zero-fill the rest.
    Basic,
    /// Average down to mono, or broadcast mono up. Other widths fall back to
    /// [`MixMode::Basic`].
    #[default]
    Blend,
}

/// Remixes `frames` interleaved f32 frames from `channels_in` to
/// `channels_out` wide.
pub(crate) fn remix(
    dst: &mut [f32],
    channels_out: usize,
    src: &[f32],
    channels_in: usize,
    frames: usize,
    mode: MixMode,
) {
    debug_assert!(src.len() >= frames * channels_in);
    debug_assert!(dst.len() >= frames * channels_out);

    if channels_in == channels_out {
        dst[..frames * channels_out].copy_from_slice(&src[..frames * channels_in]);
    } else if channels_in > channels_out {
        downmix(dst, channels_out, src, channels_in, frames, mode);
    } else {
        upmix(dst, channels_out, src, channels_in, frames, mode);
    }
}

fn downmix(
    dst: &mut [f32],
    channels_out: usize,
    src: &[f32],
    channels_in: usize,
    frames: usize,
    mode: MixMode,
) {
    if mode == MixMode::Blend && channels_out == 1 {
        for (out, frame) in dst
            .iter_mut()
            .zip(src.chunks_exact(channels_in))
            .take(frames)
        {
            *out = frame.iter().sum::<f32>() / channels_in as f32;
        }
        return;
    }

    for (out, frame) in dst
        .chunks_exact_mut(channels_out)
        .zip(src.chunks_exact(channels_in))
        .take(frames)
    {
        out.copy_from_slice(&frame[..channels_out]);
    }
}

fn upmix(
    dst: &mut [f32],
    channels_out: usize,
    src: &[f32],
    channels_in: usize,
    frames: usize,
    mode: MixMode,
) {
    if mode == MixMode::Blend && channels_in == 1 {
        for (out, frame) in dst
            .chunks_exact_mut(channels_out)
            .zip(src.chunks_exact(1))
            .take(frames)
        {
            out.fill(frame[0]);
        }
        return;
    }

    for (out, frame) in dst
        .chunks_exact_mut(channels_out)
        .zip(src.chunks_exact(channels_in))
        .take(frames)
    {
        out[..channels_in].copy_from_slice(frame);
        out[channels_in..].fill(0.0);
    }
}

/// Extends `map_in` to `map_out.len()` positions.
///
/// The first `min(in, out)` positions are taken from the input map; every
/// extra slot is filled with the first position that appears in the output
/// map but not in the input map, so the extended map stays duplicate-free.
pub(crate) fn extend_map(map_in: &[Channel], map_out: &[Channel]) -> Vec<Channel> {
    let mut extended: Vec<Channel> = map_in
        .iter()
        .take(map_out.len())
        .copied()
        .collect();

    for candidate in map_out {
        if extended.len() == map_out.len() {
            break;
        }
        if !extended.contains(candidate) {
            extended.push(*candidate);
        }
    }
    extended
}

/// Builds the permutation table between two equally sized maps.
///
/// The result satisfies `from[table[i]] == to[i]` for every output slot.
/// Returns `None` if some position in `to` does not occur in `from`, in which
/// case remapping is not possible and the caller should pass audio through
/// unshuffled.
pub(crate) fn shuffle_table(from: &[Channel], to: &[Channel]) -> Option<Vec<usize>> {
    debug_assert_eq!(from.len(), to.len());
    to.iter()
        .map(|wanted| from.iter().position(|have| have == wanted))
        .collect()
}

/// Permutes every frame of `buf` in place according to `table`.
///
/// Each frame is copied into a stack scratch before slots are written back,
/// so cyclic permutations come out right.
pub(crate) fn apply_shuffle(buf: &mut [f32], channels: usize, frames: usize, table: &[usize]) {
    debug_assert!(channels <= MAX_CHANNELS);
    debug_assert_eq!(table.len(), channels);

    let mut scratch = [0.0f32; MAX_CHANNELS];
    for frame in buf.chunks_exact_mut(channels).take(frames) {
        scratch[..channels].copy_from_slice(frame);
        for (slot, &origin) in frame.iter_mut().zip(table.iter()) {
            *slot = scratch[origin];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Channel::{BackLeft, BackRight, FrontCenter, FrontLeft, FrontRight, Lfe};

    #[test]
    fn test_default_map_known_counts() {
        assert_eq!(default_channel_map(1), vec![FrontCenter]);
        assert_eq!(default_channel_map(2), vec![FrontLeft, FrontRight]);
        assert_eq!(
            default_channel_map(6),
            vec![FrontLeft, FrontRight, FrontCenter, Lfe, BackLeft, BackRight]
        );
        assert_eq!(default_channel_map(8).len(), 8);
    }

    #[test]
    fn test_default_map_unknown_count_is_unassigned() {
        let map = default_channel_map(7);
        assert_eq!(map.len(), 7);
        assert!(map.iter().all(|c| *c == Channel::None));
    }

    #[test]
    fn test_channel_ids_are_stable() {
        assert_eq!(Channel::None.id(), 0);
        assert_eq!(FrontLeft.id(), 1);
        assert_eq!(Channel::SideRight.id(), 11);
        assert_eq!(Channel::TopBackRight.id(), 18);
    }

    #[test]
    fn test_downmix_blend_to_mono_averages() {
        let src = [1.0f32, 3.0, -2.0, 2.0];
        let mut dst = [0.0f32; 2];
        remix(&mut dst, 1, &src, 2, 2, MixMode::Blend);
        assert_eq!(dst, [2.0, 0.0]);
    }

    #[test]
    fn test_downmix_basic_drops_excess() {
        let src = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut dst = [0.0f32; 4];
        remix(&mut dst, 2, &src, 3, 2, MixMode::Basic);
        assert_eq!(dst, [1.0, 2.0, 4.0, 5.0]);
    }

    #[test]
    fn test_downmix_blend_to_stereo_falls_back_to_basic() {
        let src = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut dst = [0.0f32; 4];
        remix(&mut dst, 2, &src, 3, 2, MixMode::Blend);
        assert_eq!(dst, [1.0, 2.0, 4.0, 5.0]);
    }

    #[test]
    fn test_upmix_blend_broadcasts_mono() {
        let src = [0.5f32, -0.5];
        let mut dst = [0.0f32; 4];
        remix(&mut dst, 2, &src, 1, 2, MixMode::Blend);
        assert_eq!(dst, [0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_upmix_basic_zero_fills() {
        let src = [1.0f32, 2.0];
        let mut dst = [9.0f32; 6];
        remix(&mut dst, 3, &src, 2, 2, MixMode::Basic);
        assert_eq!(dst, [1.0, 0.0, 0.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_upmix_blend_from_stereo_falls_back_to_basic() {
        let src = [1.0f32, 2.0];
        let mut dst = [9.0f32; 3];
        remix(&mut dst, 3, &src, 2, 1, MixMode::Blend);
        assert_eq!(dst, [1.0, 2.0, 0.0]);
    }

    #[test]
    fn test_remix_equal_counts_copies() {
        let src = [1.0f32, 2.0, 3.0, 4.0];
        let mut dst = [0.0f32; 4];
        remix(&mut dst, 2, &src, 2, 2, MixMode::Blend);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_extend_map_fills_from_output_map() {
        let map_in = [FrontLeft, FrontRight];
        let map_out = [FrontLeft, FrontRight, FrontCenter, Lfe];
        let extended = extend_map(&map_in, &map_out);
        assert_eq!(extended, vec![FrontLeft, FrontRight, FrontCenter, Lfe]);
    }

    #[test]
    fn test_extend_map_truncates_when_narrowing() {
        let map_in = [FrontLeft, FrontRight, FrontCenter, Lfe];
        let map_out = [FrontLeft, FrontRight];
        assert_eq!(extend_map(&map_in, &map_out), vec![FrontLeft, FrontRight]);
    }

    #[test]
    fn test_shuffle_table_permutation() {
        let from = [FrontLeft, FrontRight, FrontCenter, Lfe, BackLeft, BackRight];
        let to = [FrontLeft, FrontRight, BackLeft, BackRight, FrontCenter, Lfe];
        let table = shuffle_table(&from, &to).unwrap();
        assert_eq!(table, vec![0, 1, 4, 5, 2, 3]);
    }

    #[test]
    fn test_shuffle_table_missing_position() {
        let from = [FrontLeft, FrontRight];
        let to = [FrontLeft, FrontCenter];
        assert!(shuffle_table(&from, &to).is_none());
    }

    #[test]
    fn test_apply_shuffle_handles_cycles() {
        // Rotate three channels: out[0]=in[2], out[1]=in[0], out[2]=in[1].
        let table = [2usize, 0, 1];
        let mut buf = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        apply_shuffle(&mut buf, 3, 2, &table);
        assert_eq!(buf, [3.0, 1.0, 2.0, 6.0, 4.0, 5.0]);
    }

    #[test]
    fn test_apply_shuffle_round_trip_is_identity() {
        let from = [FrontLeft, FrontRight, FrontCenter, Lfe, BackLeft, BackRight];
        let to = [FrontLeft, FrontRight, BackLeft, BackRight, FrontCenter, Lfe];
        let forward = shuffle_table(&from, &to).unwrap();
        let backward = shuffle_table(&to, &from).unwrap();

        let original = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut buf = original;
        apply_shuffle(&mut buf, 6, 1, &forward);
        assert_eq!(buf, [1.0, 2.0, 5.0, 6.0, 3.0, 4.0]);
        apply_shuffle(&mut buf, 6, 1, &backward);
        assert_eq!(buf, original);
    }
}
