// NTLM proxy authentication. The protocol is connection-oriented: a Type 1
// (Negotiate) message elicits a 407 carrying a Type 2 (Challenge), and the
// Type 3 (Authenticate) response must travel on the same TCP connection.
// Only the NTLMv2 hash of the password is ever kept in memory.
use crate::transport::{RawRequest, RawResponse, Transport};
use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use http::header::{HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use md4::{Digest, Md4};
use md5::Md5;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_OEM_DOMAIN_SUPPLIED: u32 = 0x0000_1000;
const NEGOTIATE_OEM_WORKSTATION_SUPPLIED: u32 = 0x0000_2000;
const NEGOTIATE_EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;

/// Seconds between the Windows epoch (1601-01-01) and the Unix epoch.
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

pub struct Authenticator {
    pub domain: String,
    pub username: String,
    hash: Vec<u8>,
}

impl Authenticator {
    pub fn new(domain: &str, username: &str, hash: Vec<u8>) -> Self {
        Authenticator {
            domain: domain.to_string(),
            username: username.to_string(),
            hash,
        }
    }

    pub fn from_password(domain: &str, username: &str, password: &str) -> Self {
        Self::new(domain, username, ntlm_hash(password))
    }

    /// The `user@domain:hash` line accepted by the NTLM_CREDENTIALS
    /// environment variable.
    pub fn credentials_line(&self) -> String {
        format!("{}@{}:{}", self.username, self.domain, hex::encode(&self.hash))
    }

    /// Runs the challenge dance for `req` over `tr`. Anything other than a
    /// 407 after the Negotiate message is returned as-is, including 407s
    /// offering schemes we don't speak.
    pub async fn authenticate(&self, req: &RawRequest, tr: &mut Transport) -> Result<RawResponse> {
        // Hostname errors aren't worth failing authentication over; the
        // workstation field may be empty.
        let workstation = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        let negotiate = negotiate_message(&self.domain, &workstation);
        let mut req = req.clone();
        req.headers
            .insert(PROXY_AUTHORIZATION, auth_header_value(&negotiate)?);
        let resp = tr.round_trip(&req).await?;
        if resp.status != 407 {
            tracing::warn!("Expected response with status 407, got {}", resp.status);
            return Ok(resp);
        }
        let challenge = extract_challenge(&resp)?;
        let authenticate = process_challenge(&challenge, &self.username, &self.domain, &self.hash)?;
        req.headers
            .insert(PROXY_AUTHORIZATION, auth_header_value(&authenticate)?);
        tr.round_trip(&req).await
    }
}

fn auth_header_value(message: &[u8]) -> Result<HeaderValue> {
    Ok(format!("NTLM {}", BASE64.encode(message)).parse()?)
}

fn extract_challenge(resp: &RawResponse) -> Result<Vec<u8>> {
    let header = resp
        .headers
        .get(PROXY_AUTHENTICATE)
        .ok_or_else(|| anyhow!("407 response without Proxy-Authenticate header"))?
        .to_str()
        .map_err(|_| anyhow!("unreadable Proxy-Authenticate header"))?;
    let b64 = header
        .strip_prefix("NTLM ")
        .ok_or_else(|| anyhow!("Proxy-Authenticate header is not an NTLM challenge"))?;
    BASE64
        .decode(b64.trim())
        .map_err(|e| anyhow!("error decoding NTLM Type 2 (Challenge) message: {}", e))
}

/// The 16-byte NTLM hash: MD4 over the UTF-16-LE encoding of the password.
pub fn ntlm_hash(password: &str) -> Vec<u8> {
    let mut hasher = Md4::new();
    hasher.update(to_unicode(password));
    hasher.finalize().to_vec()
}

fn to_unicode(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = Hmac::<Md5>::new_from_slice(key).expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// Appends a security buffer descriptor (length, allocated, offset).
fn put_secbuf(msg: &mut Vec<u8>, len: usize, offset: u32) {
    let len = len as u16;
    msg.extend_from_slice(&len.to_le_bytes());
    msg.extend_from_slice(&len.to_le_bytes());
    msg.extend_from_slice(&offset.to_le_bytes());
}

fn read_secbuf(msg: &[u8], at: usize) -> Result<&[u8]> {
    if msg.len() < at + 8 {
        bail!("NTLM message too short for security buffer at {}", at);
    }
    let len = u16::from_le_bytes([msg[at], msg[at + 1]]) as usize;
    let offset = u32::from_le_bytes([msg[at + 4], msg[at + 5], msg[at + 6], msg[at + 7]]) as usize;
    if len == 0 {
        return Ok(&[]);
    }
    msg.get(offset..offset + len)
        .ok_or_else(|| anyhow!("NTLM security buffer out of bounds"))
}

/// Builds the Type 1 (Negotiate) message. Domain and workstation travel in
/// the NetBIOS style: OEM-encoded and uppercased.
pub fn negotiate_message(domain: &str, workstation: &str) -> Vec<u8> {
    let domain = domain.to_uppercase();
    let workstation = workstation.to_uppercase();
    let flags = NEGOTIATE_UNICODE
        | REQUEST_TARGET
        | NEGOTIATE_NTLM
        | NEGOTIATE_OEM_DOMAIN_SUPPLIED
        | NEGOTIATE_OEM_WORKSTATION_SUPPLIED
        | NEGOTIATE_EXTENDED_SESSION_SECURITY
        | NEGOTIATE_128;
    let payload_offset = 32u32;
    let workstation_offset = payload_offset;
    let domain_offset = payload_offset + workstation.len() as u32;

    let mut msg = Vec::with_capacity(32 + workstation.len() + domain.len());
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&flags.to_le_bytes());
    put_secbuf(&mut msg, domain.len(), domain_offset);
    put_secbuf(&mut msg, workstation.len(), workstation_offset);
    msg.extend_from_slice(workstation.as_bytes());
    msg.extend_from_slice(domain.as_bytes());
    msg
}

/// Derives the Type 3 (Authenticate) message from a Type 2 challenge,
/// using the NTLMv2 scheme.
pub fn process_challenge(
    challenge: &[u8],
    username: &str,
    domain: &str,
    hash: &[u8],
) -> Result<Vec<u8>> {
    if challenge.len() < 32 {
        bail!("NTLM Type 2 (Challenge) message too short");
    }
    if &challenge[..8] != SIGNATURE {
        bail!("NTLM Type 2 (Challenge) message has a bad signature");
    }
    let message_type = u32::from_le_bytes(challenge[8..12].try_into().unwrap());
    if message_type != 2 {
        bail!("expected NTLM message type 2, got {}", message_type);
    }
    let flags = u32::from_le_bytes(challenge[20..24].try_into().unwrap());
    let unicode = flags & NEGOTIATE_UNICODE != 0;
    let server_challenge = &challenge[24..32];
    let target_name = read_secbuf(challenge, 12)?;
    let target_info = if challenge.len() >= 48 {
        read_secbuf(challenge, 40)?
    } else {
        &[]
    };

    // The server's target name is authoritative for the v2 hash; fall back
    // to the configured domain when it's absent.
    let target = if target_name.is_empty() {
        domain.to_string()
    } else {
        decode_ntlm_string(target_name, unicode)
    };

    let v2_hash = hmac_md5(hash, &[&to_unicode(&(username.to_uppercase() + &target))]);
    let timestamp = target_info_timestamp(target_info).unwrap_or_else(now_as_filetime);
    let mut client_challenge = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut client_challenge);

    let mut temp = Vec::with_capacity(28 + target_info.len() + 4);
    temp.extend_from_slice(&[1, 1, 0, 0, 0, 0, 0, 0]);
    temp.extend_from_slice(&timestamp);
    temp.extend_from_slice(&client_challenge);
    temp.extend_from_slice(&[0, 0, 0, 0]);
    temp.extend_from_slice(target_info);
    temp.extend_from_slice(&[0, 0, 0, 0]);
    let nt_proof = hmac_md5(&v2_hash, &[server_challenge, &temp]);
    let mut nt_response = nt_proof;
    nt_response.extend_from_slice(&temp);

    let encode = |s: &str| -> Vec<u8> {
        if unicode {
            to_unicode(s)
        } else {
            s.as_bytes().to_vec()
        }
    };
    let domain_bytes = encode(&target);
    let user_bytes = encode(username);

    // Header: signature, type, six security buffers, flags. No version
    // field, since we never set NEGOTIATE_VERSION.
    const HEADER_LEN: u32 = 64;
    let mut msg = Vec::with_capacity(
        HEADER_LEN as usize + domain_bytes.len() + user_bytes.len() + nt_response.len(),
    );
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes());
    let domain_offset = HEADER_LEN;
    let user_offset = domain_offset + domain_bytes.len() as u32;
    let lm_offset = user_offset + user_bytes.len() as u32;
    let nt_offset = lm_offset; // empty LM response
    let key_offset = nt_offset + nt_response.len() as u32;
    put_secbuf(&mut msg, 0, lm_offset);
    put_secbuf(&mut msg, nt_response.len(), nt_offset);
    put_secbuf(&mut msg, domain_bytes.len(), domain_offset);
    put_secbuf(&mut msg, user_bytes.len(), user_offset);
    put_secbuf(&mut msg, 0, key_offset); // workstation
    put_secbuf(&mut msg, 0, key_offset); // session key
    msg.extend_from_slice(&flags.to_le_bytes());
    msg.extend_from_slice(&domain_bytes);
    msg.extend_from_slice(&user_bytes);
    msg.extend_from_slice(&nt_response);
    Ok(msg)
}

fn decode_ntlm_string(bytes: &[u8], unicode: bool) -> String {
    if unicode {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Looks for the timestamp AvPair (id 0x0007) in the challenge's target
/// info block.
fn target_info_timestamp(target_info: &[u8]) -> Option<[u8; 8]> {
    let mut rest = target_info;
    while rest.len() >= 4 {
        let id = u16::from_le_bytes([rest[0], rest[1]]);
        let len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        let value = rest.get(4..4 + len)?;
        if id == 0 {
            break;
        }
        if id == 7 && len == 8 {
            return value.try_into().ok();
        }
        rest = &rest[4 + len..];
    }
    None
}

fn now_as_filetime() -> [u8; 8] {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ticks = (since_epoch.as_secs() + FILETIME_EPOCH_OFFSET) * 10_000_000
        + since_epoch.subsec_nanos() as u64 / 100;
    ticks.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HOST;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn hash_of_guest_matches_known_vector() {
        assert_eq!(
            hex::encode(ntlm_hash("guest")),
            "823893adfad2cda6e1a414f3ebdf58f7"
        );
    }

    #[test]
    fn credentials_line_format() {
        let auth = Authenticator::from_password("CORP", "malory", "guest");
        assert_eq!(
            auth.credentials_line(),
            "malory@CORP:823893adfad2cda6e1a414f3ebdf58f7"
        );
    }

    #[test]
    fn negotiate_message_layout() {
        let msg = negotiate_message("corp", "workstation");
        assert_eq!(&msg[..8], b"NTLMSSP\0");
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 1);
        // Payload carries the uppercased workstation then domain.
        assert_eq!(&msg[32..], b"WORKSTATIONCORP");
        let domain = read_secbuf(&msg, 16).unwrap();
        assert_eq!(domain, b"CORP");
        let workstation = read_secbuf(&msg, 24).unwrap();
        assert_eq!(workstation, b"WORKSTATION");
    }

    /// A synthetic Type 2 challenge: unicode flag, target name "CORP",
    /// server challenge 0x0102030405060708, and a target info block with a
    /// fixed timestamp.
    fn synthetic_challenge() -> Vec<u8> {
        let target_name = to_unicode("CORP");
        let mut target_info = Vec::new();
        // Timestamp AvPair.
        target_info.extend_from_slice(&7u16.to_le_bytes());
        target_info.extend_from_slice(&8u16.to_le_bytes());
        target_info.extend_from_slice(&0x01d700aabbccddeeu64.to_le_bytes());
        // EOL AvPair.
        target_info.extend_from_slice(&0u16.to_le_bytes());
        target_info.extend_from_slice(&0u16.to_le_bytes());

        let mut msg = Vec::new();
        msg.extend_from_slice(b"NTLMSSP\0");
        msg.extend_from_slice(&2u32.to_le_bytes());
        let target_name_offset = 48u32;
        let target_info_offset = target_name_offset + target_name.len() as u32;
        put_secbuf(&mut msg, target_name.len(), target_name_offset);
        msg.extend_from_slice(&NEGOTIATE_UNICODE.to_le_bytes());
        msg.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // server challenge
        msg.extend_from_slice(&[0u8; 8]); // reserved
        put_secbuf(&mut msg, target_info.len(), target_info_offset);
        msg.extend_from_slice(&target_name);
        msg.extend_from_slice(&target_info);
        msg
    }

    #[test]
    fn type3_response_proof_verifies() {
        let hash = ntlm_hash("guest");
        let challenge = synthetic_challenge();
        let msg = process_challenge(&challenge, "malory", "IGNORED", &hash).unwrap();
        assert_eq!(&msg[..8], b"NTLMSSP\0");
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 3);

        let nt_response = read_secbuf(&msg, 20).unwrap();
        let (proof, temp) = nt_response.split_at(16);
        // Recompute the proof from the known inputs; the target name from
        // the challenge ("CORP") takes precedence over the passed domain.
        let v2_hash = hmac_md5(&hash, &[&to_unicode("MALORYCORP")]);
        let expected = hmac_md5(&v2_hash, &[&[1, 2, 3, 4, 5, 6, 7, 8], temp]);
        assert_eq!(proof, &expected[..]);
        // The timestamp from the challenge's target info is echoed in temp.
        assert_eq!(&temp[8..16], &0x01d700aabbccddeeu64.to_le_bytes());
        // Domain and user travel in UTF-16.
        assert_eq!(read_secbuf(&msg, 28).unwrap(), to_unicode("CORP"));
        assert_eq!(read_secbuf(&msg, 36).unwrap(), to_unicode("malory"));
    }

    #[test]
    fn malformed_challenges_are_rejected() {
        let hash = ntlm_hash("guest");
        assert!(process_challenge(b"short", "u", "d", &hash).is_err());
        let mut bad_sig = synthetic_challenge();
        bad_sig[0] = b'X';
        assert!(process_challenge(&bad_sig, "u", "d", &hash).is_err());
        let mut bad_type = synthetic_challenge();
        bad_type[8] = 1;
        assert!(process_challenge(&bad_type, "u", "d", &hash).is_err());
    }

    async fn read_head(stream: &mut tokio::net::TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn full_dance_on_a_single_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let first = read_head(&mut stream).await;
            assert!(first.contains("Proxy-Authorization: NTLM "));
            let challenge = BASE64.encode(synthetic_challenge());
            stream
                .write_all(
                    format!(
                        "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: NTLM {}\r\nContent-Length: 0\r\n\r\n",
                        challenge
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();
            let second = read_head(&mut stream).await;
            let b64 = second
                .lines()
                .find_map(|l| l.strip_prefix("Proxy-Authorization: NTLM "))
                .expect("second request carries a Type 3 message")
                .to_string();
            let type3 = BASE64.decode(b64.trim()).unwrap();
            assert_eq!(&type3[..8], b"NTLMSSP\0");
            assert_eq!(u32::from_le_bytes(type3[8..12].try_into().unwrap()), 3);
            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
        });

        let auth = Authenticator::from_password("CORP", "malory", "guest");
        let mut tr = Transport::new();
        tr.dial(&addr, false).await.unwrap();
        let mut req = RawRequest::new("CONNECT", "origin.test:443");
        req.headers.insert(HOST, "origin.test:443".parse().unwrap());
        let resp = auth.authenticate(&req, &mut tr).await.unwrap();
        assert_eq!(resp.status, 200);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn non_407_after_negotiate_is_returned_verbatim() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_head(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });
        let auth = Authenticator::from_password("CORP", "malory", "guest");
        let mut tr = Transport::new();
        tr.dial(&addr, false).await.unwrap();
        let req = RawRequest::new("CONNECT", "origin.test:443");
        let resp = auth.authenticate(&req, &mut tr).await.unwrap();
        assert_eq!(resp.status, 200);
    }
}
