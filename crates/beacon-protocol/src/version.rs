//! Protocol versioning for Beacon.
//!
//! The wire version is negotiated at handshake time through the `vsn` query
//! parameter on the connection URL.

/// Current wire protocol version.
pub const WIRE_VERSION: &str = "2.0.0";

/// Query parameter name carrying the wire version.
pub const VERSION_PARAM: &str = "vsn";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_version_shape() {
        assert_eq!(WIRE_VERSION.split('.').count(), 3);
    }
}
