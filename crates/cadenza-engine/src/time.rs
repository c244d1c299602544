use serde::{Deserialize, Serialize};

/// Frame range handed to every payload for one (sub-)cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineProcessTimeInfo {
    /// Global position of the start of the enclosing block.
    pub g_start_frame: u64,
    /// Global position of `local_offset` within the block.
    pub g_start_frame_w_offset: u64,
    /// Offset into the port buffers where processing starts.
    pub local_offset: u32,
    pub nframes: u32,
}

impl EngineProcessTimeInfo {
    pub fn new(g_start_frame: u64, local_offset: u32, nframes: u32) -> Self {
        Self {
            g_start_frame,
            g_start_frame_w_offset: g_start_frame + u64::from(local_offset),
            local_offset,
            nframes,
        }
    }

    /// Exclusive global end of the processed range.
    #[inline]
    pub fn g_end_frame(&self) -> u64 {
        self.g_start_frame_w_offset + u64::from(self.nframes)
    }

    /// Buffer index range covered by this cycle.
    #[inline]
    pub fn buffer_range(&self) -> std::ops::Range<usize> {
        let start = self.local_offset as usize;
        start..start + self.nframes as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeatUnit {
    Two,
    Four,
    Eight,
    Sixteen,
}

impl BeatUnit {
    pub fn value(self) -> u32 {
        match self {
            BeatUnit::Two => 2,
            BeatUnit::Four => 4,
            BeatUnit::Eight => 8,
            BeatUnit::Sixteen => 16,
        }
    }

    /// Nearest supported unit, rounding down to a power of two.
    pub fn from_value(value: u32) -> Self {
        match value {
            0..=3 => BeatUnit::Two,
            4..=7 => BeatUnit::Four,
            8..=15 => BeatUnit::Eight,
            _ => BeatUnit::Sixteen,
        }
    }
}

impl Default for BeatUnit {
    fn default() -> Self {
        BeatUnit::Four
    }
}
