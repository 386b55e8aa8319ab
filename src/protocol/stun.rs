use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use tracing::{debug, info};

/// message type + length + magic cookie + transaction id
pub const STUN_HEADER_LEN: usize = 20;

/// consecutive unanswered binding requests before we stop trying to discover
///  our public address ourselves and trust the rendezvous server instead
pub const NUM_STUN_REQUESTS_BEFORE_FALLBACK: u32 = 5;

const RFC_5389_MAGIC_COOKIE: u32 = 0x2112A442;
const BINDING_REQUEST_TYPE: u16 = 0x0001;
const XOR_MAPPED_ADDRESS_TYPE: u16 = 0x0020;
const IPV4_FAMILY: u8 = 0x01;
const TRANSACTION_ID_LEN: usize = 12;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StunState {
    Idle,
    AwaitingResponse,
    Resolved,
    /// Self-discovery gave up: check-ins carry a zero public address so the
    ///  rendezvous server reports back the source address it observes.
    FallbackToRendezvous,
}

/// One-shot RFC 5389 exchange to learn this process's public address. Pure
///  state machine - the owning loop does the actual sending and receiving.
pub struct StunClient {
    state: StunState,
    requests_since_success: u32,
    public_addr: Option<SocketAddr>,
}
impl StunClient {
    pub fn new() -> StunClient {
        StunClient {
            state: StunState::Idle,
            requests_since_success: 0,
            public_addr: None,
        }
    }

    pub fn state(&self) -> StunState {
        self.state
    }

    pub fn public_addr(&self) -> Option<SocketAddr> {
        self.public_addr
    }

    pub fn has_fallen_back(&self) -> bool {
        self.state == StunState::FallbackToRendezvous
    }

    /// true while the public address is unknown and self-discovery has not
    ///  permanently failed
    pub fn needs_discovery(&self) -> bool {
        self.public_addr.is_none() && !self.has_fallen_back()
    }

    /// Builds the 20-byte binding request and advances the state machine:
    ///  each call counts as one (so far) unanswered request, and the call
    ///  that crosses the failure limit drops the learned public address and
    ///  falls back to the rendezvous server.
    pub fn build_binding_request(&mut self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(STUN_HEADER_LEN);
        buf.put_u16(BINDING_REQUEST_TYPE);
        buf.put_u16(0); // no attributes
        buf.put_u32(RFC_5389_MAGIC_COOKIE);

        let mut transaction_id = [0u8; TRANSACTION_ID_LEN];
        rand::rng().fill_bytes(&mut transaction_id);
        buf.put_slice(&transaction_id);

        self.requests_since_success += 1;

        if self.requests_since_success >= NUM_STUN_REQUESTS_BEFORE_FALLBACK {
            if !self.has_fallen_back() {
                info!(
                    "no STUN response after {} requests - trusting the rendezvous server for our public address",
                    self.requests_since_success
                );
            }
            self.state = StunState::FallbackToRendezvous;
            self.public_addr = None;
        }
        else {
            self.state = StunState::AwaitingResponse;
        }

        buf
    }

    /// Decodes a binding response, returning the XOR-decoded public address
    ///  if the packet contains an IPv4 XOR-MAPPED-ADDRESS attribute. Packets
    ///  that fail validation are ignored without a state change.
    pub fn process_response(&mut self, packet: &[u8]) -> Option<SocketAddr> {
        let mut buf = packet;
        if buf.remaining() < STUN_HEADER_LEN {
            return None;
        }

        let _message_type = buf.get_u16();
        let _message_length = buf.get_u16();
        if buf.get_u32() != RFC_5389_MAGIC_COOKIE {
            debug!("dropping STUN response with wrong magic cookie");
            return None;
        }
        buf.advance(TRANSACTION_ID_LEN);

        while buf.remaining() >= 4 {
            let attribute_type = buf.get_u16();
            let attribute_length = buf.get_u16() as usize;
            if buf.remaining() < attribute_length {
                return None;
            }

            if attribute_type != XOR_MAPPED_ADDRESS_TYPE {
                buf.advance(attribute_length);
                continue;
            }

            if attribute_length < 8 {
                return None;
            }
            let _reserved = buf.get_u8();
            let family = buf.get_u8();
            let xor_port = buf.get_u16();
            let xor_address = buf.get_u32();
            if family != IPV4_FAMILY {
                buf.advance(attribute_length - 8);
                continue;
            }

            let port = xor_port ^ (RFC_5389_MAGIC_COOKIE >> 16) as u16;
            let address = Ipv4Addr::from_bits(xor_address ^ RFC_5389_MAGIC_COOKIE);
            let public_addr = SocketAddr::V4(SocketAddrV4::new(address, port));

            if self.public_addr != Some(public_addr) {
                info!("public address from STUN is {}", public_addr);
            }
            self.public_addr = Some(public_addr);
            self.state = StunState::Resolved;
            self.requests_since_success = 0;

            return Some(public_addr);
        }

        None
    }
}

impl Default for StunClient {
    fn default() -> Self {
        StunClient::new()
    }
}

#[cfg(test)]
impl StunClient {
    /// test factory: a client that already knows its public address
    pub fn resolved(public_addr: SocketAddr) -> StunClient {
        StunClient {
            state: StunState::Resolved,
            requests_since_success: 0,
            public_addr: Some(public_addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// binding success response with the given attributes appended
    fn response_with_attributes(attributes: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u16(0x0101);
        buf.put_u16(attributes.len() as u16);
        buf.put_u32(RFC_5389_MAGIC_COOKIE);
        buf.put_slice(&[7u8; TRANSACTION_ID_LEN]);
        buf.put_slice(attributes);
        buf
    }

    fn xor_mapped_attribute(addr: Ipv4Addr, port: u16) -> Vec<u8> {
        let mut attr = Vec::new();
        attr.extend_from_slice(&XOR_MAPPED_ADDRESS_TYPE.to_be_bytes());
        attr.extend_from_slice(&8u16.to_be_bytes());
        attr.push(0);
        attr.push(IPV4_FAMILY);
        attr.extend_from_slice(&(port ^ (RFC_5389_MAGIC_COOKIE >> 16) as u16).to_be_bytes());
        attr.extend_from_slice(&(addr.to_bits() ^ RFC_5389_MAGIC_COOKIE).to_be_bytes());
        attr
    }

    #[test]
    fn test_binding_request_layout() {
        let mut client = StunClient::new();
        let request = client.build_binding_request();

        assert_eq!(request.len(), STUN_HEADER_LEN);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(client.state(), StunState::AwaitingResponse);
    }

    #[test]
    fn test_transaction_ids_are_random() {
        let mut client = StunClient::new();
        let a = client.build_binding_request();
        let b = client.build_binding_request();
        assert_ne!(a[8..20], b[8..20]);
    }

    #[test]
    fn test_decodes_xor_mapped_address() {
        let mut client = StunClient::new();
        client.build_binding_request();

        let expected: Ipv4Addr = "198.51.100.7".parse().unwrap();
        let response = response_with_attributes(&xor_mapped_attribute(expected, 4500));

        let decoded = client.process_response(&response).unwrap();
        assert_eq!(decoded, "198.51.100.7:4500".parse::<SocketAddr>().unwrap());
        assert_eq!(client.public_addr(), Some(decoded));
        assert_eq!(client.state(), StunState::Resolved);
        assert!(!client.needs_discovery());
    }

    #[test]
    fn test_skips_leading_attributes() {
        let mut client = StunClient::new();

        // a 4-byte SOFTWARE attribute before the mapped address
        let mut attributes = vec![0x80, 0x22, 0x00, 0x04, b't', b'e', b's', b't'];
        attributes.extend(xor_mapped_attribute("198.51.100.7".parse().unwrap(), 4500));

        let decoded = client.process_response(&response_with_attributes(&attributes));
        assert_eq!(decoded, Some("198.51.100.7:4500".parse().unwrap()));
    }

    #[test]
    fn test_rejects_wrong_magic_cookie() {
        let mut client = StunClient::new();
        let mut response = response_with_attributes(&xor_mapped_attribute(
            "198.51.100.7".parse().unwrap(),
            4500,
        ));
        response[4] = 0xff;

        assert_eq!(client.process_response(&response), None);
        assert_eq!(client.public_addr(), None);
    }

    #[test]
    fn test_ignores_non_ipv4_family() {
        let mut client = StunClient::new();
        let mut attribute = xor_mapped_attribute("198.51.100.7".parse().unwrap(), 4500);
        attribute[5] = 0x02; // IPv6 family

        assert_eq!(
            client.process_response(&response_with_attributes(&attribute)),
            None
        );
    }

    #[test]
    fn test_falls_back_after_repeated_failures() {
        let mut client = StunClient::new();
        assert!(client.needs_discovery());

        for _ in 0..NUM_STUN_REQUESTS_BEFORE_FALLBACK - 1 {
            client.build_binding_request();
            assert_eq!(client.state(), StunState::AwaitingResponse);
        }

        client.build_binding_request();
        assert_eq!(client.state(), StunState::FallbackToRendezvous);
        assert!(client.has_fallen_back());
        assert!(!client.needs_discovery());
        assert_eq!(client.public_addr(), None);
    }

    #[test]
    fn test_success_resets_the_failure_counter() {
        let mut client = StunClient::new();
        for _ in 0..NUM_STUN_REQUESTS_BEFORE_FALLBACK - 1 {
            client.build_binding_request();
        }
        client.process_response(&response_with_attributes(&xor_mapped_attribute(
            "198.51.100.7".parse().unwrap(),
            4500,
        )));

        // the counter starts over, so the next request does not trip the fallback
        client.build_binding_request();
        assert_eq!(client.state(), StunState::AwaitingResponse);
        assert_eq!(client.public_addr(), Some("198.51.100.7:4500".parse().unwrap()));
    }
}
