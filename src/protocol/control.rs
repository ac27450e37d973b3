//! Control messages exchanged on the `control` channel
//!
//! Every message is a single JSON object carrying an `ID` that names its
//! kind. Kinds this build does not know are ignored so newer peers can add
//! messages without breaking older ones.

use super::ProtocolError;
use serde::{Deserialize, Serialize};

/// Message ID of the address lease sent from server to client
pub const MESSAGE_ID_IP_ALLOCATE: &str = "ip.allocate";

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "ID")]
    id: String,
}

/// Address lease payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAllocation {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "GatewayAddress")]
    pub gateway_address: String,
    #[serde(rename = "CIDR")]
    pub cidr: String,
}

impl IpAllocation {
    pub fn new(
        ip_address: impl Into<String>,
        gateway_address: impl Into<String>,
        cidr: impl Into<String>,
    ) -> Self {
        Self {
            id: MESSAGE_ID_IP_ALLOCATE.to_string(),
            ip_address: ip_address.into(),
            gateway_address: gateway_address.into(),
            cidr: cidr.into(),
        }
    }
}

/// A recognized control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    IpAllocate(IpAllocation),
}

impl ControlMessage {
    /// Decode a control message.
    ///
    /// Returns `Ok(None)` for well-formed messages of an unknown kind.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(data)?;
        match envelope.id.as_str() {
            MESSAGE_ID_IP_ALLOCATE => {
                let msg: IpAllocation = serde_json::from_slice(data)?;
                Ok(Some(ControlMessage::IpAllocate(msg)))
            }
            _ => Ok(None),
        }
    }

    /// Encode as a JSON object
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            ControlMessage::IpAllocate(msg) => Ok(serde_json::to_vec(msg)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_wire_format() {
        let msg = ControlMessage::IpAllocate(IpAllocation::new(
            "10.0.0.2",
            "10.0.0.1",
            "10.0.0.0/24",
        ));
        let encoded = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(value["ID"], "ip.allocate");
        assert_eq!(value["IPAddress"], "10.0.0.2");
        assert_eq!(value["GatewayAddress"], "10.0.0.1");
        assert_eq!(value["CIDR"], "10.0.0.0/24");

        assert_eq!(ControlMessage::decode(&encoded).unwrap(), Some(msg));
    }

    #[test]
    fn test_unknown_kind_is_ignored() {
        let data = br#"{"ID":"route.update","Routes":[]}"#;
        assert_eq!(ControlMessage::decode(data).unwrap(), None);
    }

    #[test]
    fn test_malformed_is_error() {
        assert!(ControlMessage::decode(b"not json").is_err());
        assert!(ControlMessage::decode(br#"{"Kind":"ip.allocate"}"#).is_err());
        // Known kind with missing fields
        assert!(ControlMessage::decode(br#"{"ID":"ip.allocate"}"#).is_err());
    }
}
