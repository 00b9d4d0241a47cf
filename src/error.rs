// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Every way a render can fail.  None of these are retried: a device
//! that was missing at startup will still be missing a moment later,
//! and a render is either complete or it is nothing.

use failure::Fail;

/// The error taxonomy for the whole pipeline.  Each variant carries
/// enough context (the operation, and the device when we know it) to
/// tell a user what went wrong without a debugger.
#[derive(Debug, Fail)]
pub enum RenderError {
    /// No compatible compute device could be found.
    #[fail(display = "no {} device available: {}", backend, reason)]
    DeviceUnavailable {
        /// The back end that was asked for a device.
        backend: &'static str,
        /// Why acquisition failed.
        reason: String,
    },

    /// Host to device (or device to host) memory traffic failed.
    #[fail(display = "{} failed on {}: {}", operation, device, reason)]
    Transfer {
        /// The copy or allocation that failed.
        operation: &'static str,
        /// The device the transfer targeted.
        device: String,
        /// The driver's account of the failure.
        reason: String,
    },

    /// A runtime-compiled kernel would not build.  The log is the
    /// compiler's own output, verbatim.
    #[fail(display = "kernel build failed on {}:\n{}", device, log)]
    KernelBuild {
        /// The device the kernel was built for.
        device: String,
        /// The build log.
        log: String,
    },

    /// The parallel launch itself failed, including grids that do not
    /// partition the image exactly.
    #[fail(display = "dispatch failed on {}: {}", device, reason)]
    Dispatch {
        /// The device the launch targeted.
        device: String,
        /// Why the launch was refused.
        reason: String,
    },

    /// The palette image could not be read or decoded.
    #[fail(display = "could not load palette {}: {}", path, reason)]
    PaletteLoad {
        /// Where the palette was expected.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// A configuration value is out of range.
    #[fail(display = "invalid configuration: {}", _0)]
    InvalidConfig(String),

    /// The finished image could not be written.
    #[fail(display = "could not write image {}: {}", path, reason)]
    ImageWrite {
        /// The output path.
        path: String,
        /// What went wrong.
        reason: String,
    },
}

/// Results within the renderer.
pub type Result<T> = std::result::Result<T, RenderError>;

impl RenderError {
    pub(crate) fn dispatch<D: ToString, R: ToString>(device: D, reason: R) -> Self {
        RenderError::Dispatch {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn transfer<D: ToString, R: ToString>(
        operation: &'static str,
        device: D,
        reason: R,
    ) -> Self {
        RenderError::Transfer {
            operation,
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn unavailable<R: ToString>(backend: &'static str, reason: R) -> Self {
        RenderError::DeviceUnavailable {
            backend,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_build_log_is_reported_verbatim() {
        let err = RenderError::KernelBuild {
            device: "test-device".to_string(),
            log: "<kernel>:3:5: error: use of undeclared identifier 'zz'".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("test-device"));
        assert!(text.ends_with("<kernel>:3:5: error: use of undeclared identifier 'zz'"));
    }

    #[test]
    fn dispatch_error_names_the_device() {
        let err = RenderError::dispatch("host", "1000 is not a multiple of 32");
        assert_eq!(
            err.to_string(),
            "dispatch failed on host: 1000 is not a multiple of 32"
        );
    }
}
