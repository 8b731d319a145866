// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Types used to address the transceiver ports behind a port CPLD.

use serde::Deserialize;
use serde::Serialize;

// The type used to address the front-panel ports.
//
// This is a bitmask where each bit position corresponds to the CPLD port index
// with that number. I.e., CPLD port 0 (front-panel port 1) is at bit 0 here.
type MaskType = u32;

/// A bitmask used to identify a set of transceiver ports on one port CPLD.
#[derive(Clone, Copy, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[repr(transparent)]
pub struct PortMask(pub MaskType);

impl core::fmt::Debug for PortMask {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "PortMask(0x{:08x})", self.0)
    }
}

/// Attempt to address an invalid transceiver port.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, thiserror::Error)]
#[error("Invalid transceiver port: {0}")]
pub struct InvalidPort(pub u8);

impl PortMask {
    pub const MAX_INDEX: u8 = (core::mem::size_of::<MaskType>() * 8) as _;

    /// Return true if the provided index is set, or false otherwise. If the
    /// index is out of range, and error is returned.
    pub fn is_set(&self, index: u8) -> Result<bool, InvalidPort> {
        if index >= Self::MAX_INDEX {
            Err(InvalidPort(index))
        } else {
            Ok((self.0 & (1 << index)) != 0)
        }
    }

    /// Set the bit at the provided index. If it is out of range, an error is
    /// returned.
    pub fn set(&mut self, index: u8) -> Result<(), InvalidPort> {
        if index >= Self::MAX_INDEX {
            Err(InvalidPort(index))
        } else {
            self.0 |= 1 << index;
            Ok(())
        }
    }

    /// Clear the bit at the provided index. If it is out of range, an error is
    /// returned.
    pub fn clear(&mut self, index: u8) -> Result<(), InvalidPort> {
        if index >= Self::MAX_INDEX {
            Err(InvalidPort(index))
        } else {
            self.0 &= !(1 << index);
            Ok(())
        }
    }

    /// Construct a port bitmask from an iterator over indices.
    ///
    /// If any index is out of bounds, an error is returned.
    pub fn from_index_iter<I: Iterator<Item = u8>>(it: I) -> Result<Self, InvalidPort> {
        let mut out = 0;
        for index in it {
            if index >= Self::MAX_INDEX {
                return Err(InvalidPort(index));
            }
            out |= 1 << index;
        }
        Ok(Self(out))
    }

    /// Construct a port bitmask from a slice of indices.
    pub fn from_indices(indices: &[u8]) -> Result<Self, InvalidPort> {
        Self::from_index_iter(indices.iter().copied())
    }

    /// Return the indices of the ports identified by the bitmask, in
    /// increasing order.
    pub fn to_indices(&self) -> impl Iterator<Item = u8> + '_ {
        (0..Self::MAX_INDEX).filter(|i| self.contains(*i))
    }

    /// A convenience function to return a port bitmask identifying a single
    /// port by index.
    pub const fn single(index: u8) -> Result<Self, InvalidPort> {
        if index >= Self::MAX_INDEX {
            Err(InvalidPort(index))
        } else {
            Ok(Self(1 << index))
        }
    }

    /// Return the number of ports addressed by `self`.
    pub const fn selected_port_count(&self) -> usize {
        self.0.count_ones() as _
    }

    /// Return true if the number of ports is zero.
    pub const fn is_empty(&self) -> bool {
        self.selected_port_count() == 0
    }

    /// Convience function to address all ports.
    pub const fn all() -> Self {
        Self(!0)
    }

    /// Convience function to address zero ports.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Return the set of ports that are in `self` and not `other`.
    pub const fn remove(&self, other: &Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Merge the set of ports in `self` and `other`, returning a copy.
    pub const fn merge(&self, other: &Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Return `true` if the provided index is contained in set of addressed
    /// ports. Out-of-range indices are never contained.
    pub const fn contains(&self, ix: u8) -> bool {
        ix < Self::MAX_INDEX && (self.0 & (1 << ix)) != 0
    }
}

/// Convert a zero-based CPLD port index into the 1-based number printed on
/// the front panel.
pub const fn front_port_number(index: u8) -> u16 {
    index as u16 + 1
}

bitflags::bitflags! {
    /// The CPLD-reported status of a single transceiver port.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PortStatus: u8 {
        /// A module is seated in the cage.
        const PRESENT = 0b0000_0001;

        /// The module is held in reset.
        const RESET   = 0b0000_0010;
    }
}

impl core::fmt::Display for PortStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let present = if self.contains(PortStatus::PRESENT) {
            "present"
        } else {
            "absent"
        };
        if self.contains(PortStatus::RESET) {
            write!(f, "{present}, in reset")
        } else {
            write!(f, "{present}")
        }
    }
}

/// A utility function to merge data for two sets of ports.
///
/// Operations on many ports return one data item per addressed port, stored
/// compressed in a `Vec<T>` in the order of `PortMask::to_indices()`. This
/// merges two such sets (a set union) along with their data, such that the
/// output data is again in index order.
///
/// # Example
///
/// ```rust
/// use switch_platform_types::PortMask;
/// use switch_platform_types::port::merge_port_data;
///
/// let first = PortMask(0b101);
/// let first_data = vec![0, 2];
/// let second = PortMask(0b010);
/// let second_data = vec![1];
/// let (ports, data) = merge_port_data(first, first_data.iter(), second, second_data.iter());
/// assert_eq!(ports, PortMask(0b111));
/// assert_eq!(data, &[0, 1, 2]);
/// ```
///
/// Note that if both masks contain a given index, the second one will be
/// chosen.
pub fn merge_port_data<'a, T: Clone + 'a>(
    first: PortMask,
    first_data: impl Iterator<Item = &'a T>,
    second: PortMask,
    second_data: impl Iterator<Item = &'a T>,
) -> (PortMask, Vec<T>) {
    let n_items = first.selected_port_count() + second.selected_port_count();
    let mut out = Vec::with_capacity(n_items);

    let mut first_it = first.to_indices().zip(first_data).peekable();
    let mut second_it = second.to_indices().zip(second_data).peekable();
    loop {
        let (Some(f), Some(s)) = (first_it.peek(), second_it.peek()) else {
            break;
        };
        let item = match f.0.cmp(&s.0) {
            core::cmp::Ordering::Less => first_it.next(),
            core::cmp::Ordering::Greater => second_it.next(),
            core::cmp::Ordering::Equal => {
                let _ = first_it.next();
                second_it.next()
            }
        };
        if let Some((_, item)) = item {
            out.push(item.clone());
        }
    }
    // Only one of these will actually be consumable.
    out.extend(first_it.map(|it| it.1.clone()));
    out.extend(second_it.map(|it| it.1.clone()));

    (first.merge(&second), out)
}

#[cfg(test)]
mod tests {
    use super::front_port_number;
    use super::merge_port_data;
    use super::InvalidPort;
    use super::MaskType;
    use super::PortMask;
    use super::PortStatus;

    #[test]
    fn test_port_mask_from_indices() {
        let ix = vec![0, 1, 2, 31];
        let ports = PortMask::from_indices(&ix).unwrap();
        assert_eq!(ports.0, 0x8000_0007);
        assert_eq!(ports.to_indices().collect::<Vec<_>>(), ix);
    }

    #[test]
    fn test_port_mask_from_indices_out_of_range() {
        let port = PortMask::MAX_INDEX;
        assert_eq!(PortMask::from_indices(&[port]), Err(InvalidPort(port)));
    }

    #[test]
    fn test_port_mask_test_set_clear() {
        let mut ports = PortMask(0b101);
        assert!(ports.is_set(0).unwrap());
        assert!(!ports.is_set(1).unwrap());
        assert!(ports.is_set(2).unwrap());

        ports.set(1).unwrap();
        assert!(ports.is_set(1).unwrap());

        ports.clear(1).unwrap();
        assert!(!ports.is_set(1).unwrap());

        assert!(ports.set(32).is_err());
        assert!(ports.clear(200).is_err());
        assert!(ports.is_set(32).is_err());
        assert!(!ports.contains(200));
    }

    #[test]
    fn test_port_mask_all_and_count() {
        assert_eq!(PortMask::all().0, MaskType::MAX);
        assert_eq!(PortMask::all().selected_port_count(), 32);
        assert!(PortMask::empty().is_empty());
        assert_eq!(PortMask(0b111).remove(&PortMask(0b001)), PortMask(0b110));
    }

    #[test]
    fn test_front_port_number_is_one_based() {
        assert_eq!(front_port_number(0), 1);
        assert_eq!(front_port_number(31), 32);
    }

    #[test]
    fn test_port_status_display() {
        assert_eq!(PortStatus::PRESENT.to_string(), "present");
        assert_eq!(
            (PortStatus::PRESENT | PortStatus::RESET).to_string(),
            "present, in reset"
        );
        assert_eq!(PortStatus::empty().to_string(), "absent");
    }

    #[test]
    fn test_merge_port_data() {
        let first = PortMask(0b101);
        let first_data = vec![0, 2];
        let second = PortMask(0b010);
        let second_data = vec![1];
        let (ports, data) = merge_port_data(first, first_data.iter(), second, second_data.iter());
        assert_eq!(ports, PortMask(0b111));
        assert_eq!(data, &[0, 1, 2]);

        // Overlapping indices take the second item.
        let (ports, data) = merge_port_data(first, first_data.iter(), first, [7, 8].iter());
        assert_eq!(ports, first);
        assert_eq!(data, &[7, 8]);
    }

    #[test]
    fn test_port_mask_serializes_as_integer() {
        let ports = PortMask(0b1001);
        let json = serde_json::to_string(&ports).unwrap();
        assert_eq!(json, "9");
        assert_eq!(serde_json::from_str::<PortMask>(&json).unwrap(), ports);
    }
}
