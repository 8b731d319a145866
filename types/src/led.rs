// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Front-panel status LEDs and the modes they can display.

use serde::Deserialize;
use serde::Serialize;

/// One of the board's CPLD-driven status LEDs.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum LedKind {
    /// The locator LED.
    Loc,
    /// The system diagnostic LED.
    Diag,
    /// The summary fan LED.
    Fan,
    Psu1,
    Psu2,
    /// The per-tray fan LEDs.
    Fan1,
    Fan2,
    Fan3,
    Fan4,
    Fan5,
}

impl LedKind {
    /// Every LED, in the order they are listed on the board.
    pub const ALL: [LedKind; 10] = [
        LedKind::Loc,
        LedKind::Diag,
        LedKind::Fan,
        LedKind::Psu1,
        LedKind::Psu2,
        LedKind::Fan1,
        LedKind::Fan2,
        LedKind::Fan3,
        LedKind::Fan4,
        LedKind::Fan5,
    ];

    /// The name of the LED, as it appears in the LED class device name.
    pub const fn name(&self) -> &'static str {
        match self {
            LedKind::Loc => "loc",
            LedKind::Diag => "diag",
            LedKind::Fan => "fan",
            LedKind::Psu1 => "psu1",
            LedKind::Psu2 => "psu2",
            LedKind::Fan1 => "fan1",
            LedKind::Fan2 => "fan2",
            LedKind::Fan3 => "fan3",
            LedKind::Fan4 => "fan4",
            LedKind::Fan5 => "fan5",
        }
    }
}

impl core::fmt::Display for LedKind {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The light pattern shown by an LED.
///
/// The discriminants are the brightness values used for each mode, where
/// `Auto` hands control of the LED back to the CPLD.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[cfg_attr(feature = "api-traits", derive(schemars::JsonSchema))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LedMode {
    #[default]
    Off = 0,
    Green,
    Amber,
    Red,
    GreenBlink,
    AmberBlink,
    RedBlink,
    Auto,
}

impl LedMode {
    pub const ALL: [LedMode; 8] = [
        LedMode::Off,
        LedMode::Green,
        LedMode::Amber,
        LedMode::Red,
        LedMode::GreenBlink,
        LedMode::AmberBlink,
        LedMode::RedBlink,
        LedMode::Auto,
    ];

    /// Return true if this mode blinks.
    pub const fn is_blink(&self) -> bool {
        matches!(
            self,
            LedMode::GreenBlink | LedMode::AmberBlink | LedMode::RedBlink
        )
    }
}

impl From<LedMode> for u8 {
    fn from(mode: LedMode) -> u8 {
        mode as u8
    }
}

/// A brightness value that does not name an LED mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("Invalid LED brightness: {0}")]
pub struct InvalidBrightness(pub u8);

impl TryFrom<u8> for LedMode {
    type Error = InvalidBrightness;

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        LedMode::ALL
            .get(usize::from(x))
            .copied()
            .ok_or(InvalidBrightness(x))
    }
}

impl core::fmt::Display for LedMode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let s = match self {
            LedMode::Off => "off",
            LedMode::Green => "green",
            LedMode::Amber => "amber",
            LedMode::Red => "red",
            LedMode::GreenBlink => "green-blink",
            LedMode::AmberBlink => "amber-blink",
            LedMode::RedBlink => "red-blink",
            LedMode::Auto => "auto",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::InvalidBrightness;
    use super::LedKind;
    use super::LedMode;

    #[test]
    fn test_led_mode_brightness_values() {
        for (i, mode) in LedMode::ALL.iter().enumerate() {
            assert_eq!(u8::from(*mode), i as u8);
            assert_eq!(LedMode::try_from(i as u8).unwrap(), *mode);
        }
        assert_eq!(LedMode::try_from(8), Err(InvalidBrightness(8)));
    }

    #[test]
    fn test_led_mode_is_blink() {
        let blinks: Vec<_> = LedMode::ALL.iter().filter(|m| m.is_blink()).collect();
        assert_eq!(
            blinks,
            vec![&LedMode::GreenBlink, &LedMode::AmberBlink, &LedMode::RedBlink]
        );
    }

    #[test]
    fn test_led_serde_names() {
        assert_eq!(serde_json::to_string(&LedKind::Psu1).unwrap(), "\"psu1\"");
        assert_eq!(
            serde_json::to_string(&LedMode::GreenBlink).unwrap(),
            "\"green_blink\""
        );
        assert_eq!(LedKind::Fan3.to_string(), "fan3");
    }
}
