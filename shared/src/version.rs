// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

/// The protocol version written into the OP_RETURN payload.
pub const PROTOCOL_VERSION: u8 = 5;

/// The state-blob version literal paired with protocol version 5. The
/// off-by-one is historical and must be preserved for compatibility.
pub const STATE_VERSION: &str = "04";

/// Renders the protocol version as the 2-char hex byte used on the wire.
pub fn protocol_version_hex() -> String {
    format!("{:02x}", PROTOCOL_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_pairing() {
        assert_eq!(PROTOCOL_VERSION, 5);
        assert_eq!(STATE_VERSION, "04");
        assert_eq!(protocol_version_hex(), "05");
    }
}
