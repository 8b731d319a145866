// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Decoding of transceiver identifying information.

use crate::Error;
use std::fmt;
use std::ops::Range;

/// The byte of a transceiver memory map holding its SFF-8024 identifier.
pub const IDENTIFIER_OFFSET: u8 = 0;

/// The SFF-8472 byte holding the 10G Ethernet compliance codes.
pub const SFP_COMPLIANCE_OFFSET: u8 = 3;

/// The mask of the 10GBASE-* compliance bits.
pub const SFP_10G_COMPLIANCE_MASK: u8 = 0xF0;

/// The SFF-8472 byte describing diagnostic monitoring support.
pub const SFP_DIAG_MONITORING_OFFSET: u8 = 92;

/// The bit indicating digital diagnostic monitoring is implemented.
pub const SFP_DDM_IMPLEMENTED_MASK: u8 = 0x40;

/// The SFF-8024 identifier for a transceiver module.
///
/// This identifier is used as the main description of the kind of module, and
/// indicates the management standard it conforms to. Only the identifiers of
/// modules found in these platforms' cages are named; others are carried by
/// value.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
#[cfg_attr(
    any(feature = "api-traits", test),
    derive(serde::Deserialize, serde::Serialize, schemars::JsonSchema)
)]
#[cfg_attr(any(feature = "api-traits", test), serde(rename_all = "snake_case"))]
pub enum Identifier {
    Unknown,
    Gbic,
    Soldered,
    Sfp,
    Xfp,
    Qsfp,
    QsfpPlus,
    Qsfp28,
    QsfpDD,
    QsfpPlusCmis,
    Other(u8),
    Reserved(u8),
    VendorSpecific(u8),
}

impl From<u8> for Identifier {
    fn from(x: u8) -> Self {
        use Identifier::*;
        match x {
            0x00 => Unknown,
            0x01 => Gbic,
            0x02 => Soldered,
            0x03 => Sfp,
            0x06 => Xfp,
            0x0c => Qsfp,
            0x0d => QsfpPlus,
            0x11 => Qsfp28,
            0x18 => QsfpDD,
            0x1e => QsfpPlusCmis,
            0x21..=0x7f => Reserved(x),
            0x80.. => VendorSpecific(x),
            _ => Other(x),
        }
    }
}

impl From<Identifier> for u8 {
    fn from(id: Identifier) -> Self {
        use Identifier::*;
        match id {
            Unknown => 0x00,
            Gbic => 0x01,
            Soldered => 0x02,
            Sfp => 0x03,
            Xfp => 0x06,
            Qsfp => 0x0c,
            QsfpPlus => 0x0d,
            Qsfp28 => 0x11,
            QsfpDD => 0x18,
            QsfpPlusCmis => 0x1e,
            Other(x) | Reserved(x) | VendorSpecific(x) => x,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Identifier::*;
        match self {
            Unknown => write!(f, "Unknown or unspecified"),
            Gbic => write!(f, "GBIC"),
            Soldered => write!(f, "Module/connector soldered to motherboard"),
            Sfp => write!(f, "SFP/SFP+/SFP28"),
            Xfp => write!(f, "XFP"),
            Qsfp => write!(f, "QSFP"),
            QsfpPlus => write!(f, "QSFP+ with SFF-8636 management interface"),
            Qsfp28 => write!(f, "QSFP28 with SFF-8636 management interface"),
            QsfpDD => write!(f, "QSFP-DD Double Density 8X Pluggable Transceiver"),
            QsfpPlusCmis => write!(f, "QSFP+ with Common Management Interface Specification"),
            Other(x) => write!(f, "Other (0x{x:02x})"),
            Reserved(x) => write!(f, "Reserved (0x{x:02x})"),
            VendorSpecific(x) => write!(f, "Vendor Specific (0x{x:02x})"),
        }
    }
}

/// The kind of module seated in a transceiver cage.
///
/// The discriminants are the values reported for the `port_type` attribute.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(
    any(feature = "api-traits", test),
    derive(serde::Deserialize, serde::Serialize, schemars::JsonSchema)
)]
#[cfg_attr(any(feature = "api-traits", test), serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum PortType {
    /// A module is present, but not one this cage supports.
    #[default]
    Invalid = 0,
    NotPresent,
    Sfp,
    SfpPlus,
    Qsfp,
    QsfpPlus,
    Qsfp28,
}

impl PortType {
    /// Classify an SFP cage's module from its identifier and 10G compliance
    /// bytes.
    pub const fn from_sfp(identifier: u8, compliance: u8) -> Self {
        if identifier != 0x03 {
            return PortType::Invalid;
        }
        if compliance & SFP_10G_COMPLIANCE_MASK != 0 {
            PortType::SfpPlus
        } else {
            PortType::Sfp
        }
    }

    /// Classify a QSFP cage's module from its identifier byte.
    pub fn from_qsfp(identifier: u8) -> Self {
        match Identifier::from(identifier) {
            Identifier::Qsfp => PortType::Qsfp,
            Identifier::QsfpPlus => PortType::QsfpPlus,
            Identifier::Qsfp28 => PortType::Qsfp28,
            _ => PortType::Invalid,
        }
    }
}

impl From<PortType> for u8 {
    fn from(t: PortType) -> u8 {
        t as u8
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            PortType::Invalid => "invalid",
            PortType::NotPresent => "not present",
            PortType::Sfp => "SFP",
            PortType::SfpPlus => "SFP+",
            PortType::Qsfp => "QSFP",
            PortType::QsfpPlus => "QSFP+",
            PortType::Qsfp28 => "QSFP28",
        };
        write!(f, "{s}")
    }
}

/// Return true if an SFP advertises digital diagnostic monitoring, given
/// its diagnostic monitoring type byte.
pub const fn ddm_implemented(diag_monitoring: u8) -> bool {
    diag_monitoring & SFP_DDM_IMPLEMENTED_MASK != 0
}

/// An Organization Unique Identifier.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(
    any(feature = "api-traits", test),
    derive(serde::Deserialize, serde::Serialize, schemars::JsonSchema)
)]
pub struct Oui(pub [u8; 3]);

impl fmt::Display for Oui {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}-{:02x}-{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

/// Vendor-specific information about a transceiver module.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(
    any(feature = "api-traits", test),
    derive(serde::Deserialize, serde::Serialize, schemars::JsonSchema)
)]
pub struct Vendor {
    pub name: String,
    pub oui: Oui,
    pub part: String,
    pub revision: String,
    pub serial: String,
    pub date: Option<String>,
}

// The absolute locations of the vendor fields within one memory map.
struct VendorLayout {
    name: Range<usize>,
    oui: Range<usize>,
    part: Range<usize>,
    revision: Range<usize>,
    serial: Range<usize>,
    date: Range<usize>,
}

impl VendorLayout {
    fn end(&self) -> usize {
        self.date.end
    }
}

// See SFF-8472 rev 12.3 Table 4-1, the A0h serial ID page.
const SFP_LAYOUT: VendorLayout = VendorLayout {
    name: 20..36,
    oui: 37..40,
    part: 40..56,
    revision: 56..60,
    serial: 68..84,
    date: 84..92,
};

// See SFF-8636 rev 2.10a Table 6-14, upper page 00h.
const QSFP_LAYOUT: VendorLayout = VendorLayout {
    name: 148..164,
    oui: 165..168,
    part: 168..184,
    revision: 184..186,
    serial: 196..212,
    date: 212..220,
};

impl Vendor {
    /// Parse the vendor fields from an SFP's A0h memory map.
    pub fn from_sfp_map(map: &[u8]) -> Result<Self, Error> {
        Self::parse(map, &SFP_LAYOUT)
    }

    /// Parse the vendor fields from a QSFP's memory map, with upper page 00h
    /// mapped.
    pub fn from_qsfp_map(map: &[u8]) -> Result<Self, Error> {
        Self::parse(map, &QSFP_LAYOUT)
    }

    fn parse(map: &[u8], layout: &VendorLayout) -> Result<Self, Error> {
        if map.len() < layout.end() {
            return Err(Error::ParseFailed);
        }
        let mut oui = [0u8; 3];
        oui.copy_from_slice(&map[layout.oui.clone()]);
        let date = Some(ascii_to_string(&map[layout.date.clone()])).filter(|s| !s.is_empty());
        Ok(Self {
            name: ascii_to_string(&map[layout.name.clone()]),
            oui: Oui(oui),
            part: ascii_to_string(&map[layout.part.clone()]),
            revision: ascii_to_string(&map[layout.revision.clone()]),
            serial: ascii_to_string(&map[layout.serial.clone()]),
            date,
        })
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", &self.name, &self.part)
    }
}

fn ascii_to_string(buf: &[u8]) -> String {
    let valid = match std::str::from_utf8(buf) {
        Ok(s) => s,
        Err(e) => {
            let (valid, _) = buf.split_at(e.valid_up_to());
            std::str::from_utf8(valid).unwrap_or_default()
        }
    };
    valid.trim_end_matches(['\0', ' ']).to_string()
}

#[cfg(test)]
mod tests {
    use super::ddm_implemented;
    use super::Identifier;
    use super::Oui;
    use super::PortType;
    use super::Vendor;
    use crate::Error;

    #[test]
    fn test_identifier_round_trips_through_u8() {
        for x in 0..=u8::MAX {
            assert_eq!(u8::from(Identifier::from(x)), x);
        }
        assert_eq!(Identifier::from(0x11), Identifier::Qsfp28);
        assert_eq!(Identifier::from(0x90), Identifier::VendorSpecific(0x90));
    }

    #[test]
    fn test_sfp_port_type() {
        assert_eq!(PortType::from_sfp(0x03, 0x10), PortType::SfpPlus);
        assert_eq!(PortType::from_sfp(0x03, 0x0F), PortType::Sfp);
        assert_eq!(PortType::from_sfp(0x0d, 0xFF), PortType::Invalid);
    }

    #[test]
    fn test_qsfp_port_type() {
        assert_eq!(PortType::from_qsfp(0x0c), PortType::Qsfp);
        assert_eq!(PortType::from_qsfp(0x0d), PortType::QsfpPlus);
        assert_eq!(PortType::from_qsfp(0x11), PortType::Qsfp28);
        assert_eq!(PortType::from_qsfp(0x03), PortType::Invalid);
        assert_eq!(u8::from(PortType::Qsfp28), 6);
        assert_eq!(u8::from(PortType::NotPresent), 1);
    }

    #[test]
    fn test_ddm_implemented() {
        assert!(ddm_implemented(0x68));
        assert!(!ddm_implemented(0x28));
    }

    fn place(map: &mut [u8], offset: usize, data: &[u8]) {
        map[offset..offset + data.len()].copy_from_slice(data);
    }

    #[test]
    fn test_parse_vendor_from_sfp_map() {
        let mut map = vec![0; 256];
        place(&mut map, 20, b"some vendor     ");
        place(&mut map, 37, &[1, 2, 3]);
        place(&mut map, 40, b"some part num   ");
        place(&mut map, 56, b"A1  ");
        place(&mut map, 68, b"some serial     ");
        place(&mut map, 84, b"230101  ");

        let vendor = Vendor::from_sfp_map(&map).unwrap();
        assert_eq!(vendor.name, "some vendor");
        assert_eq!(vendor.oui, Oui([1, 2, 3]));
        assert_eq!(vendor.part, "some part num");
        assert_eq!(vendor.revision, "A1");
        assert_eq!(vendor.serial, "some serial");
        assert_eq!(vendor.date.as_deref(), Some("230101"));
        assert_eq!(vendor.to_string(), "some vendor some part num");
    }

    #[test]
    fn test_parse_vendor_from_qsfp_map() {
        let mut map = vec![0; 256];
        place(&mut map, 148, b"qsfp vendor     ");
        place(&mut map, 165, &[0xa8, 0x40, 0x25]);
        place(&mut map, 168, b"part            ");
        place(&mut map, 184, b"re");
        place(&mut map, 196, b"sn              ");

        let vendor = Vendor::from_qsfp_map(&map).unwrap();
        assert_eq!(vendor.name, "qsfp vendor");
        assert_eq!(vendor.oui.to_string(), "a8-40-25");
        assert_eq!(vendor.revision, "re");
        assert_eq!(vendor.serial, "sn");

        // The date field was left as NULs.
        assert!(vendor.date.is_none());
    }

    #[test]
    fn test_parse_vendor_short_map() {
        assert_eq!(Vendor::from_qsfp_map(&[0; 128]), Err(Error::ParseFailed));
    }

    #[test]
    fn test_port_type_serdes() {
        assert_eq!(
            serde_json::to_string(&PortType::SfpPlus).unwrap(),
            "\"sfp_plus\""
        );
    }
}
