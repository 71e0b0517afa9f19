//! PSID-style port-set partitioning (draft-ietf-softwire-map)
//!
//! The translatable port space above the system range is split into
//! `2^ratio_bits` shares. Within a share, ports come in contiguous runs of
//! `2^adjacent_bits`; `offset` picks which run slice of every group belongs
//! to this instance:
//!
//! ```text
//!   port = group << (ratio_bits + adjacent_bits)
//!        | offset << adjacent_bits
//!        | k                          (0 <= k < 2^adjacent_bits)
//! ```

/// Ports below this value are reserved for system services
pub const SYSTEM_PORT_LIMIT: u32 = 1024;

const PORT_SPACE: u32 = 1 << 16;

/// Position of the highest set bit, `fls(v) - 1`. Zero is treated as one.
fn bit_width(value: u16) -> u32 {
    if value == 0 {
        0
    } else {
        15 - value.leading_zeros()
    }
}

/// Port-sharing parameters of one translator instance
///
/// `ratio` and `adjacent` are counts (number of shares, run length) and are
/// reduced to bit widths internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSet {
    pub ratio: u16,
    pub adjacent: u16,
    pub offset: u16,
}

impl PortSet {
    pub fn new(ratio: u16, adjacent: u16, offset: u16) -> Self {
        Self {
            ratio,
            adjacent,
            offset,
        }
    }

    /// 1:1 mode: no address sharing, translated port equals original port
    pub fn one_to_one() -> Self {
        Self::new(1, 1, 0)
    }

    pub fn ratio_bits(&self) -> u32 {
        bit_width(self.ratio)
    }

    pub fn adjacent_bits(&self) -> u32 {
        bit_width(self.adjacent)
    }

    fn shift(&self) -> u32 {
        self.ratio_bits() + self.adjacent_bits()
    }

    pub fn is_one_to_one(&self) -> bool {
        self.ratio_bits() == 0
    }

    /// Lowest port this share may hand out
    pub fn start_port(&self) -> u32 {
        SYSTEM_PORT_LIMIT.max(1 << self.shift())
    }

    /// Upper bound on distinct translated ports held at once
    pub fn capacity(&self) -> usize {
        (PORT_SPACE.saturating_sub(self.start_port()) >> self.ratio_bits()) as usize
    }

    /// Offset reduced into `[0, 2^ratio_bits)`
    pub fn share_index(&self) -> u32 {
        u32::from(self.offset) & ((1 << self.ratio_bits()) - 1)
    }

    /// Length of one contiguous run of ports
    pub fn run_len(&self) -> u32 {
        1 << self.adjacent_bits()
    }

    /// Inclusive range of group indices usable above `start_port`.
    /// `None` when the parameters leave no usable group.
    pub fn group_range(&self) -> Option<(u32, u32)> {
        let shift = self.shift();
        let low = ((self.start_port() - 1) >> shift) + 1;
        let high = (PORT_SPACE >> shift).checked_sub(1)?;
        (low <= high).then_some((low, high))
    }

    /// Group index of a port
    pub fn group_of(&self, port: u16) -> u32 {
        u32::from(port) >> self.shift()
    }

    /// Compose the port at run position `k` of `group`
    pub fn port(&self, group: u32, k: u32) -> u16 {
        let port = (group << self.shift()) | (self.share_index() << self.adjacent_bits()) | k;
        port as u16
    }

    /// Whether `port` belongs to this share and lies above the reserved range
    pub fn contains(&self, port: u16) -> bool {
        if u32::from(port) < self.start_port() {
            return false;
        }
        if self.is_one_to_one() {
            return true;
        }
        let mask = (1 << self.ratio_bits()) - 1;
        (u32::from(port) >> self.adjacent_bits()) & mask == self.share_index()
    }
}

impl Default for PortSet {
    fn default() -> Self {
        Self::one_to_one()
    }
}
