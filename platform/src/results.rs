// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2023 Oxide Computer Company

//! Types for handling data returned by accessing multiple ports.
//!
//! A [`PortMask`] addresses any set of the CPLD's transceiver ports at once.
//! An operation over such a set should return everything it could read, as
//! well as the reason it failed on each of the other ports, rather than
//! stopping at the first empty cage. That is not a `Result`, which is either
//! a value _or_ an error, so we use a struct instead. [`PortResult`] holds:
//!
//! - The ports which succeeded.
//! - The data, one item per successful port, in port order.
//! - The ports which failed and their errors, in [`FailedPorts`].

use crate::PortError;
use switch_platform_decode::PortType;
use switch_platform_decode::Vendor;
use switch_platform_types::port::merge_port_data;
use switch_platform_types::PortMask;
use switch_platform_types::PortStatus;

/// Information about ports we failed to access.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FailedPorts {
    /// The ports we failed to access.
    pub ports: PortMask,
    /// One error for each port above, specifying the reason for failure.
    pub errors: Vec<PortError>,
}

impl FailedPorts {
    /// Merge another set of failed ports and this one, returning their union.
    ///
    /// Note that `self` and `other` _may_ contain duplicate ports. In that
    /// case, the error from `other` is kept.
    pub fn merge(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.merge_into(other);
        out
    }

    /// Merge another set of failed ports _into_ this one, in place.
    pub fn merge_into(&mut self, other: &Self) {
        let (ports, errors) =
            merge_port_data(self.ports, self.errors.iter(), other.ports, other.errors.iter());
        *self = FailedPorts { ports, errors };
    }

    /// Return `Self` with no failures at all.
    pub const fn success() -> Self {
        Self {
            ports: PortMask::empty(),
            errors: vec![],
        }
    }

    /// Record a failure on a single port.
    pub fn push(&mut self, port: u8, error: PortError) {
        if let Ok(single) = PortMask::single(port) {
            self.merge_into(&FailedPorts {
                ports: single,
                errors: vec![error],
            });
        }
    }

    /// Return an iterator over the failures, including the port indices and
    /// corresponding error.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &PortError)> + '_ {
        self.ports.to_indices().zip(self.errors.iter())
    }

    /// Return the error for the port with the provided index, if it exists.
    pub fn nth(&self, index: u8) -> Option<&PortError> {
        self.iter()
            .find(|(ix, _item)| ix == &index)
            .map(|(_ix, item)| item)
    }
}

/// A generic type for accessing port-specific data and failures.
///
/// One should generally use the type aliases for this, such as
/// [`StatusResult`], which name the kind of data returned.
#[derive(Clone, Debug, Default)]
pub struct PortResult<P> {
    pub ports: PortMask,
    pub data: Vec<P>,
    pub failures: FailedPorts,
}

impl<P: Clone> PortResult<P> {
    /// Build a result by calling `f` on each port of `ports`, in order.
    pub fn collect<E>(ports: PortMask, mut f: impl FnMut(u8) -> Result<P, E>) -> Self
    where
        PortError: From<E>,
    {
        let mut out = Self {
            ports: PortMask::empty(),
            data: Vec::with_capacity(ports.selected_port_count()),
            failures: FailedPorts::success(),
        };
        for port in ports.to_indices() {
            match f(port) {
                Ok(item) => {
                    // `port` comes from `to_indices()`, so it is in range.
                    out.ports.0 |= 1 << port;
                    out.data.push(item);
                }
                Err(e) => out.failures.push(port, PortError::from(e)),
            }
        }
        out
    }

    /// Merge two results, keeping the data and failures of both.
    pub fn merge(&self, other: &Self) -> Self {
        let (ports, data) =
            merge_port_data(self.ports, self.data.iter(), other.ports, other.data.iter());
        Self {
            ports,
            data,
            failures: self.failures.merge(&other.failures),
        }
    }
}

impl<P> PortResult<P> {
    /// Return an iterator over the port indices and the corresponding data
    /// from that port.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &P)> + '_ {
        self.ports.to_indices().zip(self.data.iter())
    }

    /// Return an iterator over the _errors_ in the result, with the port
    /// indices and the corresponding error.
    pub fn error_iter(&self) -> impl Iterator<Item = (u8, &PortError)> + '_ {
        self.failures.iter()
    }

    /// Return the data item for the port with the provided index, if it
    /// exists.
    pub fn nth(&self, index: u8) -> Option<&P> {
        self.iter()
            .find(|(ix, _item)| ix == &index)
            .map(|(_ix, item)| item)
    }

    /// Return the error for the port with the provided index, if it exists.
    pub fn nth_err(&self, index: u8) -> Option<&PortError> {
        self.failures.nth(index)
    }
}

impl<P> PartialEq for PortResult<P>
where
    P: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        if self.ports != other.ports {
            return false;
        }
        if self.data != other.data {
            return false;
        }
        self.failures == other.failures
    }
}

/// The result of reading a region of EEPROM from a set of ports.
pub type ReadResult = PortResult<Vec<u8>>;

/// The result of reading the CPLD status of a set of ports.
pub type StatusResult = PortResult<PortStatus>;

/// The result of classifying the modules in a set of ports.
pub type PortTypeResult = PortResult<PortType>;

/// The result of reading vendor information from a set of ports.
pub type VendorResult = PortResult<Vendor>;

/// The result of an operation on ports that has no data on success, but may
/// fail, such as placing modules in reset.
pub type AckResult = PortResult<()>;

impl AckResult {
    /// Return a result with all successes, i.e., no failed ports.
    pub fn success(ports: PortMask) -> Self {
        Self::ack(ports, FailedPorts::success())
    }

    /// Return an `AckResult` from the successful and failed ports.
    pub fn ack(ports: PortMask, failures: FailedPorts) -> Self {
        Self {
            ports,
            data: vec![(); ports.selected_port_count()],
            failures,
        }
    }
}
