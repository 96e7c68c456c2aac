//! # Peer Connection
//!
//! This module implements the client side of the peer wire protocol for a
//! single connection: TCP connect, handshake, the optional extension
//! sub-handshake, and the request/piece pipeline used to download pieces.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! connect -> handshake -> [extension handshake] -> pre-download -> download
//! ```
//!
//! - **handshake**: 68-byte frames are exchanged and the echoed info-hash
//!   must match the one we asked for.
//! - **extension handshake** (magnet bootstrap only): after the peer's
//!   bitfield arrives, extension handshakes are exchanged and the peer's
//!   `ut_metadata` id is recorded for metadata requests.
//! - **pre-download**: send `interested`, wait for `unchoke`.
//! - **download**: request blocks in waves and reassemble them.
//!
//! ## Block Pipeline
//!
//! A piece is fetched in 16384-byte blocks. Up to five requests are sent
//! per wave, then exactly that many `piece` replies are read back. Replies
//! may arrive in any order within the wave; each block lands at the offset
//! its payload declares, after a bounds check.
//!
//! ## Timeouts
//!
//! Waiting for a specific message uses a one-second read deadline on the
//! socket. Keep-alives are dropped while waiting; unrelated messages are
//! logged and skipped. On any error the owning worker closes the
//! connection by dropping it.

use crate::bencode::Value;
use crate::handshake::{Handshake, HANDSHAKE_SIZE};
use crate::message::*;
use crate::peer::{gen_peer_id, Peer};
use crate::piece::PieceWork;

use anyhow::{anyhow, bail, Result};
use boring::sha::Sha1;
use byteorder::{BigEndian, ReadBytesExt};

use std::fmt;
use std::io::{Cursor, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

// Standard block size for piece downloads (16KB)
const BLOCK_SIZE: u32 = 16384;

// Maximum number of in-flight block requests per wave
const PIPELINE_DEPTH: usize = 5;

const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(1);

/// A downloaded piece whose SHA-1 did not match the torrent metadata.
///
/// Kept as a distinct error type so the scheduler can tell a bad piece
/// (connection still usable, retry elsewhere) from a broken connection.
#[derive(Debug)]
pub struct HashMismatch {
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for HashMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "piece hash mismatch: expected {}, got {}",
            self.expected, self.actual
        )
    }
}

impl std::error::Error for HashMismatch {}

/// A connection to a remote peer, past the handshake.
///
/// Owned by exactly one worker at a time; dropping it closes the socket.
#[derive(Debug)]
pub struct Client {
    /// Endpoint of the remote peer
    peer: Peer,
    /// TCP stream connection to the peer
    conn: TcpStream,
    /// 20-byte identifier the peer sent in its handshake
    peer_id: [u8; 20],
    /// The peer's ut_metadata id, when the extension handshake succeeded
    extension_id: Option<u8>,
}

impl Client {
    /// Connect to a peer and perform the plain handshake.
    pub fn connect(peer: Peer, info_hash: [u8; 20]) -> Result<Client> {
        Self::dial(peer, info_hash, false)
    }

    /// Connect to a peer, advertise extension support, and perform the
    /// extension sub-handshake.
    ///
    /// Fails if the peer does not advertise the extension protocol or does
    /// not offer `ut_metadata`.
    pub fn connect_with_extensions(peer: Peer, info_hash: [u8; 20]) -> Result<Client> {
        Self::dial(peer, info_hash, true)
    }

    fn dial(peer: Peer, info_hash: [u8; 20], extensions: bool) -> Result<Client> {
        // Open connection with remote peer
        let peer_socket = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let conn = TcpStream::connect_timeout(&peer_socket, DIAL_TIMEOUT)
            .map_err(|e| anyhow!("could not connect to peer {}: {}", peer, e))?;

        conn.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
        conn.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let mut client = Client {
            peer,
            conn,
            peer_id: [0; 20],
            extension_id: None,
        };

        client.handshake(info_hash, extensions)?;

        if extensions {
            client.extension_handshake()?;
        }

        Ok(client)
    }

    /// Exchange handshake frames and verify the echoed info-hash.
    fn handshake(&mut self, info_hash: [u8; 20], extensions: bool) -> Result<()> {
        let handshake = if extensions {
            Handshake::with_extensions(info_hash, gen_peer_id())
        } else {
            Handshake::new(info_hash, gen_peer_id())
        };

        self.conn
            .write_all(&handshake.serialize())
            .map_err(|e| anyhow!("could not send handshake to peer {}: {}", self.peer, e))?;

        let mut buf = [0; HANDSHAKE_SIZE];
        self.conn
            .read_exact(&mut buf)
            .map_err(|e| anyhow!("could not read handshake from peer {}: {}", self.peer, e))?;

        let reply = Handshake::deserialize(&buf)?;

        // A peer echoing a different hash is serving a different torrent
        if reply.info_hash != info_hash {
            bail!("peer {} echoed a different info hash", self.peer);
        }
        if extensions && !reply.supports_extensions() {
            bail!("peer {} does not support the extension protocol", self.peer);
        }

        self.peer_id = reply.peer_id;

        debug!("handshake with peer {} succeeded", self.peer);

        Ok(())
    }

    /// Exchange extension handshakes and record the peer's ut_metadata id.
    ///
    /// The peer announces its pieces first, so the bitfield is consumed
    /// before the extension handshake is sent. It is not used for
    /// scheduling; missing pieces surface as failed downloads and are
    /// retried elsewhere.
    fn extension_handshake(&mut self) -> Result<()> {
        self.wait_for_message(MESSAGE_BITFIELD)?;

        let payload = ExtensionPayload::handshake().serialize();
        self.send_message(&Message::new_with_payload(MESSAGE_EXTENDED, payload))?;

        let reply = self.wait_for_message(MESSAGE_EXTENDED)?;
        let ext = ExtensionPayload::deserialize(&reply.payload)?;

        let remote_id = ext
            .dict
            .get("m")
            .and_then(|m| m.get("ut_metadata"))
            .and_then(|id| id.as_int())
            .map_err(|_| anyhow!("peer {} did not offer ut_metadata", self.peer))?;

        debug!("peer {} speaks ut_metadata as id {}", self.peer, remote_id);

        self.extension_id = Some(remote_id as u8);

        Ok(())
    }

    /// Endpoint of the remote peer.
    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// The 20-byte identifier the peer sent in its handshake.
    pub fn peer_id(&self) -> &[u8; 20] {
        &self.peer_id
    }

    /// The peer's ut_metadata id, when the extension handshake succeeded.
    pub fn extension_id(&self) -> Option<u8> {
        self.extension_id
    }

    /// Fetch the info dictionary from the peer over the extension protocol.
    ///
    /// Requests metadata piece 0, which covers info dictionaries up to one
    /// 16 KiB metadata piece.
    pub fn request_metadata(&mut self) -> Result<Value> {
        let remote_id = self
            .extension_id
            .ok_or_else(|| anyhow!("peer {} does not support the extension protocol", self.peer))?;

        let payload = ExtensionPayload::metadata_request(remote_id, 0).serialize();
        self.send_message(&Message::new_with_payload(MESSAGE_EXTENDED, payload))?;

        let reply = self.wait_for_message(MESSAGE_EXTENDED)?;
        let ext = ExtensionPayload::deserialize(&reply.payload)?;

        let msg_type = ext.dict.get("msg_type")?.as_int()?;
        if msg_type != EXT_MSG_DATA {
            bail!(
                "peer {} answered metadata request with msg_type {}",
                self.peer,
                msg_type
            );
        }

        ext.trailing
            .ok_or_else(|| anyhow!("peer {} sent a metadata reply without a payload", self.peer))
    }

    /// Prepare the connection for downloading.
    ///
    /// Sends `interested` and waits until the peer unchokes us.
    pub fn pre_download(&mut self) -> Result<()> {
        self.send_message(&Message::new(MESSAGE_INTERESTED))?;
        self.wait_for_message(MESSAGE_UNCHOKE)?;

        Ok(())
    }

    /// Download and verify one piece.
    ///
    /// Blocks are requested in waves of up to `PIPELINE_DEPTH`; each wave
    /// is fully drained before the next is sent. The assembled piece must
    /// match the expected hash or the download fails with `HashMismatch`.
    pub fn download_piece(&mut self, work: &PieceWork) -> Result<Vec<u8>> {
        let mut data = vec![0; work.length as usize];

        // Split the piece into block requests; the final block takes the
        // remainder
        let block_count = work.length.div_ceil(BLOCK_SIZE);
        let requests: Vec<RequestPayload> = (0..block_count)
            .map(|block| {
                let begin = block * BLOCK_SIZE;
                let length = BLOCK_SIZE.min(work.length - begin);
                RequestPayload::new(work.index, begin, length)
            })
            .collect();

        for wave in requests.chunks(PIPELINE_DEPTH) {
            for request in wave {
                self.send_message(&Message::new_with_payload(
                    MESSAGE_REQUEST,
                    request.serialize(),
                ))?;
            }

            // Read exactly as many piece replies as requests went out;
            // blocks may arrive in any order within the wave
            for _ in wave {
                let message = self.wait_for_message(MESSAGE_PIECE)?;
                let block = PiecePayload::deserialize(&message.payload)?;

                if block.index != work.index {
                    bail!(
                        "peer {} sent a block of piece {} while downloading piece {}",
                        self.peer,
                        block.index,
                        work.index
                    );
                }

                let begin = block.begin as usize;
                let end = begin + block.block.len();
                if end > data.len() {
                    bail!(
                        "peer {} sent an out-of-bounds block [{}:{}] for piece {}",
                        self.peer,
                        begin,
                        end,
                        work.index
                    );
                }

                data[begin..end].copy_from_slice(&block.block);
            }
        }

        verify_piece(&data, &work.hash)?;

        debug!("piece {} downloaded from peer {}", work.index, self.peer);

        Ok(data)
    }

    /// Send a message to the peer.
    fn send_message(&mut self, message: &Message) -> Result<()> {
        let encoded = message.serialize()?;

        self.conn
            .write_all(&encoded)
            .map_err(|e| anyhow!("could not send message to peer {}: {}", self.peer, e))?;

        Ok(())
    }

    /// Read one message from the peer.
    ///
    /// Two reads: the 4-byte length prefix, then the full body. A length
    /// of zero is a keep-alive.
    fn read_message(&mut self) -> Result<Message> {
        let mut len_buf = [0; 4];
        self.conn
            .read_exact(&mut len_buf)
            .map_err(|e| self.classify_read_error(e))?;

        let message_len = Cursor::new(len_buf).read_u32::<BigEndian>()? as usize;
        if message_len == 0 {
            return Ok(Message::new(MESSAGE_KEEPALIVE));
        }

        let mut message_buf = vec![0; message_len];
        self.conn
            .read_exact(&mut message_buf)
            .map_err(|e| self.classify_read_error(e))?;

        deserialize_message(&message_buf)
    }

    fn classify_read_error(&self, e: std::io::Error) -> anyhow::Error {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                anyhow!("timed out waiting for a message from peer {}", self.peer)
            }
            _ => anyhow!("could not read message from peer {}: {}", self.peer, e),
        }
    }

    /// Read messages until one with the expected id arrives.
    ///
    /// Keep-alives are dropped; anything else is logged and skipped. Each
    /// read is bounded by the per-message deadline.
    fn wait_for_message(&mut self, expected: MessageId) -> Result<Message> {
        self.conn.set_read_timeout(Some(MESSAGE_TIMEOUT))?;

        loop {
            let message = self.read_message()?;

            if message.id == expected {
                return Ok(message);
            }

            if message.id == MESSAGE_KEEPALIVE {
                debug!("dropping keep-alive from peer {}", self.peer);
                continue;
            }

            debug!(
                "got message id {} from peer {} while waiting for id {}",
                message.id, self.peer, expected
            );
        }
    }
}

/// Check a downloaded piece against its expected hex-encoded SHA-1.
fn verify_piece(data: &[u8], expected: &str) -> Result<()> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let actual = hex::encode(hasher.finish());

    if actual != expected {
        return Err(HashMismatch {
            expected: expected.to_string(),
            actual,
        }
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    const FAKE_PEER_ID: [u8; 20] = *b"-RM0001-abcdefghijkl";
    const INFO_HASH: [u8; 20] = [7; 20];

    /// Start a scripted peer on a loopback port.
    fn start_peer<F>(script: F) -> Peer
    where
        F: FnOnce(TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            script(stream);
        });

        Peer {
            ip: Ipv4Addr::LOCALHOST,
            port,
        }
    }

    /// Read the client's handshake and echo one back.
    fn echo_handshake(stream: &mut TcpStream, extensions: bool) {
        let mut buf = [0; HANDSHAKE_SIZE];
        stream.read_exact(&mut buf).unwrap();
        let incoming = Handshake::deserialize(&buf).unwrap();

        let reply = if extensions {
            Handshake::with_extensions(incoming.info_hash, FAKE_PEER_ID)
        } else {
            Handshake::new(incoming.info_hash, FAKE_PEER_ID)
        };
        stream.write_all(&reply.serialize()).unwrap();
    }

    fn send_peer_message(stream: &mut TcpStream, id: MessageId, payload: Vec<u8>) {
        let encoded = Message::new_with_payload(id, payload).serialize().unwrap();
        stream.write_all(&encoded).unwrap();
    }

    fn read_peer_message(stream: &mut TcpStream) -> Message {
        let len = stream.read_u32::<BigEndian>().unwrap() as usize;
        let mut buf = vec![0; len];
        stream.read_exact(&mut buf).unwrap();
        deserialize_message(&buf).unwrap()
    }

    fn sha1_hex(data: &[u8]) -> String {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hex::encode(hasher.finish())
    }

    #[test]
    fn connect_exchanges_handshakes() {
        let peer = start_peer(|mut stream| {
            echo_handshake(&mut stream, false);
        });

        let client = Client::connect(peer, INFO_HASH).unwrap();
        assert_eq!(client.peer_id(), &FAKE_PEER_ID);
        assert_eq!(client.extension_id(), None);
    }

    #[test]
    fn connect_rejects_echoed_info_hash_mismatch() {
        let peer = start_peer(|mut stream| {
            let mut buf = [0; HANDSHAKE_SIZE];
            stream.read_exact(&mut buf).unwrap();

            let reply = Handshake::new([9; 20], FAKE_PEER_ID);
            stream.write_all(&reply.serialize()).unwrap();
        });

        let err = Client::connect(peer, INFO_HASH).unwrap_err();
        assert!(err.to_string().contains("different info hash"));
    }

    #[test]
    fn connect_with_extensions_requires_peer_support() {
        let peer = start_peer(|mut stream| {
            // Plain handshake, extension bit cleared
            echo_handshake(&mut stream, false);
        });

        let err = Client::connect_with_extensions(peer, INFO_HASH).unwrap_err();
        assert!(err.to_string().contains("extension protocol"));
    }

    #[test]
    fn pre_download_skips_messages_before_unchoke() {
        let peer = start_peer(|mut stream| {
            echo_handshake(&mut stream, false);

            let interested = read_peer_message(&mut stream);
            assert_eq!(interested.id, MESSAGE_INTERESTED);

            // A bitfield and a keep-alive arrive before the unchoke
            send_peer_message(&mut stream, MESSAGE_BITFIELD, vec![0xFF]);
            stream.write_all(&[0, 0, 0, 0]).unwrap();
            send_peer_message(&mut stream, MESSAGE_UNCHOKE, vec![]);
        });

        let mut client = Client::connect(peer, INFO_HASH).unwrap();
        client.pre_download().unwrap();
    }

    #[test]
    fn wait_for_message_times_out_on_a_silent_peer() {
        let peer = start_peer(|mut stream| {
            echo_handshake(&mut stream, false);

            let _ = read_peer_message(&mut stream);
            // Never answer; hold the socket open until the client gives up
            thread::sleep(Duration::from_secs(3));
        });

        let mut client = Client::connect(peer, INFO_HASH).unwrap();
        let err = client.pre_download().unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn download_piece_reassembles_out_of_order_waves() {
        // Six blocks: one full wave of five, then one more
        let piece_length = 6 * BLOCK_SIZE;
        let data: Vec<u8> = (0..piece_length).map(|i| (i % 251) as u8).collect();
        let served = data.clone();

        let peer = start_peer(move |mut stream| {
            echo_handshake(&mut stream, false);

            let interested = read_peer_message(&mut stream);
            assert_eq!(interested.id, MESSAGE_INTERESTED);
            send_peer_message(&mut stream, MESSAGE_UNCHOKE, vec![]);

            for wave_size in [5, 1] {
                let mut requests = Vec::new();
                for _ in 0..wave_size {
                    let message = read_peer_message(&mut stream);
                    assert_eq!(message.id, MESSAGE_REQUEST);
                    requests.push(RequestPayload::deserialize(&message.payload).unwrap());
                }

                // Answer the wave in reverse order
                for request in requests.iter().rev() {
                    let begin = request.begin as usize;
                    let block = served[begin..begin + request.length as usize].to_vec();
                    let payload = PiecePayload::new(request.index, request.begin, block);
                    send_peer_message(&mut stream, MESSAGE_PIECE, payload.serialize());
                }
            }
        });

        let mut client = Client::connect(peer, INFO_HASH).unwrap();
        client.pre_download().unwrap();

        let work = PieceWork::new(0, sha1_hex(&data), piece_length);
        let downloaded = client.download_piece(&work).unwrap();
        assert_eq!(downloaded, data);
    }

    #[test]
    fn download_piece_detects_corrupted_data() {
        let piece_length = 100;
        let data = vec![0xAB; piece_length as usize];

        let peer = start_peer(move |mut stream| {
            echo_handshake(&mut stream, false);

            let _ = read_peer_message(&mut stream);
            send_peer_message(&mut stream, MESSAGE_UNCHOKE, vec![]);

            let message = read_peer_message(&mut stream);
            let request = RequestPayload::deserialize(&message.payload).unwrap();

            // Serve zeroes instead of the real data
            let payload = PiecePayload::new(request.index, 0, vec![0; request.length as usize]);
            send_peer_message(&mut stream, MESSAGE_PIECE, payload.serialize());
        });

        let mut client = Client::connect(peer, INFO_HASH).unwrap();
        client.pre_download().unwrap();

        let work = PieceWork::new(0, sha1_hex(&data), piece_length);
        let err = client.download_piece(&work).unwrap_err();
        assert!(err.downcast_ref::<HashMismatch>().is_some());
    }

    #[test]
    fn download_piece_rejects_out_of_bounds_blocks() {
        let piece_length = 100;

        let peer = start_peer(move |mut stream| {
            echo_handshake(&mut stream, false);

            let _ = read_peer_message(&mut stream);
            send_peer_message(&mut stream, MESSAGE_UNCHOKE, vec![]);

            let message = read_peer_message(&mut stream);
            let request = RequestPayload::deserialize(&message.payload).unwrap();

            // Block lands past the end of the piece
            let payload =
                PiecePayload::new(request.index, piece_length, vec![0; request.length as usize]);
            send_peer_message(&mut stream, MESSAGE_PIECE, payload.serialize());
        });

        let mut client = Client::connect(peer, INFO_HASH).unwrap();
        client.pre_download().unwrap();

        let work = PieceWork::new(0, "00".repeat(20), piece_length);
        let err = client.download_piece(&work).unwrap_err();
        assert!(err.to_string().contains("out-of-bounds"));
    }

    #[test]
    fn extension_handshake_and_metadata_fetch() {
        use crate::bencode;

        use std::collections::BTreeMap;

        // The info dictionary the fake peer will serve
        let mut info_entries = BTreeMap::new();
        info_entries.insert(b"length".to_vec(), Value::Int(42));
        info_entries.insert(b"name".to_vec(), Value::Bytes(b"magnet.gif".to_vec()));
        info_entries.insert(b"piece length".to_vec(), Value::Int(16384));
        info_entries.insert(b"pieces".to_vec(), Value::Bytes(vec![3; 20]));
        let info = Value::Dict(info_entries);
        let served_info = info.clone();

        let peer = start_peer(move |mut stream| {
            echo_handshake(&mut stream, true);

            // The peer announces its pieces before extension traffic
            send_peer_message(&mut stream, MESSAGE_BITFIELD, vec![0x80]);

            let message = read_peer_message(&mut stream);
            assert_eq!(message.id, MESSAGE_EXTENDED);
            let ext = ExtensionPayload::deserialize(&message.payload).unwrap();
            assert_eq!(ext.ext_id, EXT_HANDSHAKE_ID);

            // Advertise ut_metadata under id 42
            let mut extensions = BTreeMap::new();
            extensions.insert(b"ut_metadata".to_vec(), Value::Int(42));
            let mut reply = BTreeMap::new();
            reply.insert(b"m".to_vec(), Value::Dict(extensions));
            let payload = ExtensionPayload::new(EXT_HANDSHAKE_ID, Value::Dict(reply)).serialize();
            send_peer_message(&mut stream, MESSAGE_EXTENDED, payload);

            // Serve the metadata request
            let message = read_peer_message(&mut stream);
            let request = ExtensionPayload::deserialize(&message.payload).unwrap();
            assert_eq!(request.ext_id, 42);
            assert_eq!(
                request.dict.get("msg_type").unwrap().as_int().unwrap(),
                EXT_MSG_REQUEST
            );
            assert_eq!(request.dict.get("piece").unwrap().as_int().unwrap(), 0);

            let encoded_info = bencode::encode(&served_info);
            let mut header = BTreeMap::new();
            header.insert(b"msg_type".to_vec(), Value::Int(EXT_MSG_DATA));
            header.insert(b"piece".to_vec(), Value::Int(0));
            header.insert(
                b"total_size".to_vec(),
                Value::Int(encoded_info.len() as i64),
            );
            let mut data_msg = ExtensionPayload::new(1, Value::Dict(header));
            data_msg.trailing = Some(served_info.clone());
            send_peer_message(&mut stream, MESSAGE_EXTENDED, data_msg.serialize());
        });

        let mut client = Client::connect_with_extensions(peer, INFO_HASH).unwrap();
        assert_eq!(client.extension_id(), Some(42));

        let fetched = client.request_metadata().unwrap();
        assert_eq!(fetched, info);
    }

    #[test]
    fn verify_piece_accepts_matching_hash() {
        let data = b"some piece bytes";
        assert!(verify_piece(data, &sha1_hex(data)).is_ok());
        assert!(verify_piece(data, &"00".repeat(20)).is_err());
    }
}
