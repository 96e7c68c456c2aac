//! # Remora BitTorrent Client
//!
//! A command-line BitTorrent (v1) download client written in Rust.
//!
//! ## Features
//!
//! - Bencoding codec with canonical re-encoding
//! - Torrent metainfo parsing and info-hash computation
//! - Magnet link bootstrap over the extension protocol (ut_metadata)
//! - HTTP tracker peer discovery
//! - Multi-peer concurrent downloading with retry and SHA-1 verification
//!
//! ## Usage
//!
//! ```bash
//! remora info debian.iso.torrent
//! remora download -o debian.iso debian.iso.torrent
//! remora magnet_download -o file.bin "magnet:?xt=urn:btih:..."
//! ```
//!
//! ## Architecture
//!
//! - **Main thread**: Parses arguments, loads the torrent or magnet,
//!   coordinates the download
//! - **Worker threads**: Each owns one peer connection
//! - **Channels**: Distribute piece work and collect piece outcomes

#[macro_use]
extern crate log;

mod bencode;
mod client;
mod handshake;
mod magnet;
mod message;
mod metainfo;
mod peer;
mod piece;
mod torrent;
mod tracker;
mod worker;

use crate::client::Client;
use crate::magnet::Magnet;
use crate::metainfo::MetaFile;
use crate::peer::Peer;
use crate::piece::PieceWork;
use crate::torrent::Torrent;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent download client, written in Rust."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "snake_case")]
enum Command {
    /// Decode a bencoded value and print it as JSON
    Decode {
        /// The bencoded value
        value: String,
    },
    /// Print the metadata of a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Print the peers the tracker returns for a torrent
    Peers {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Handshake with one peer and print its peer id
    Handshake {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Peer address as ip:port
        peer: String,
    },
    /// Download a single piece from the first peer
    DownloadPiece {
        /// Output filename
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Zero-based piece index
        piece: u32,
    },
    /// Download the whole file
    Download {
        /// Output filename
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Path to the .torrent file
        torrent: PathBuf,
    },
    /// Parse a magnet link and print its fields
    MagnetParse {
        /// The magnet link
        link: String,
    },
    /// Handshake with a peer from a magnet link, with extension support
    MagnetHandshake {
        /// The magnet link
        link: String,
    },
    /// Fetch metadata via a magnet link and print it
    MagnetInfo {
        /// The magnet link
        link: String,
    },
    /// Download a single piece via a magnet link
    MagnetDownloadPiece {
        /// Output filename
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// The magnet link
        link: String,
        /// Zero-based piece index
        piece: u32,
    },
    /// Download the whole file via a magnet link
    MagnetDownload {
        /// Output filename
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// The magnet link
        link: String,
    },
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Decode { value } => {
            let decoded = bencode::decode_bytes(value.as_bytes())?;
            println!("{}", bencode::to_json(&decoded));
        }
        Command::Info { torrent } => {
            let mf = MetaFile::parse(torrent)?;
            print_info(&mf);
        }
        Command::Peers { torrent } => {
            let mf = MetaFile::parse(torrent)?;
            let peers = tracker::discover_peers(&mf.announce, &mf.info.info_hash, mf.info.length)?;
            for peer in peers {
                println!("{}", peer);
            }
        }
        Command::Handshake { torrent, peer } => {
            let mf = MetaFile::parse(torrent)?;
            let peer: Peer = peer.parse()?;
            let client = Client::connect(peer, mf.info.info_hash)?;
            println!("Peer ID: {}", hex::encode(client.peer_id()));
        }
        Command::DownloadPiece {
            output,
            torrent,
            piece,
        } => {
            let mf = MetaFile::parse(torrent)?;
            let peers = tracker::discover_peers(&mf.announce, &mf.info.info_hash, mf.info.length)?;
            let mut client = Client::connect(first_peer(&peers)?, mf.info.info_hash)?;

            let data = download_single_piece(&mf, &mut client, piece)?;
            write_output(&output, &data)?;
            println!("Piece downloaded to: {}", output.display());
        }
        Command::Download { output, torrent } => {
            let mf = MetaFile::parse(torrent)?;
            let data = Torrent::new(mf)?.download()?;
            write_output(&output, &data)?;
            println!("File downloaded to: {}", output.display());
        }
        Command::MagnetParse { link } => {
            let magnet = Magnet::parse(&link)?;
            println!("Tracker URL: {}", magnet.tracker_url);
            println!("Info Hash: {}", hex::encode(magnet.info_hash));
            println!("Filename: {}", magnet.display_name);
        }
        Command::MagnetHandshake { link } => {
            let magnet = Magnet::parse(&link)?;
            let peers = tracker::discover_peers(&magnet.tracker_url, &magnet.info_hash, 1)?;
            let client = Client::connect_with_extensions(first_peer(&peers)?, magnet.info_hash)?;

            println!("Peer ID: {}", hex::encode(client.peer_id()));
            let extension_id = client
                .extension_id()
                .ok_or_else(|| anyhow!("peer did not offer ut_metadata"))?;
            println!("Peer Metadata Extension ID: {}", extension_id);
        }
        Command::MagnetInfo { link } => {
            let (mf, _client) = fetch_magnet_metadata(&link)?;
            print_info(&mf);
        }
        Command::MagnetDownloadPiece {
            output,
            link,
            piece,
        } => {
            let (mf, mut client) = fetch_magnet_metadata(&link)?;
            let data = download_single_piece(&mf, &mut client, piece)?;
            write_output(&output, &data)?;
            println!("Piece downloaded to: {}", output.display());
        }
        Command::MagnetDownload { output, link } => {
            let (mf, client) = fetch_magnet_metadata(&link)?;
            // The swarm is re-dialled with the full metadata in hand
            drop(client);

            let data = Torrent::new(mf)?.download()?;
            write_output(&output, &data)?;
            println!("File downloaded to: {}", output.display());
        }
    }

    Ok(())
}

/// Print the metadata block of a torrent.
fn print_info(mf: &MetaFile) {
    println!("Tracker URL: {}", mf.announce);
    println!("Length: {}", mf.info.length);
    println!("Info Hash: {}", hex::encode(mf.info.info_hash));
    println!("Piece Length: {}", mf.info.piece_length);
    println!("Piece Hashes:");
    for hash in &mf.info.piece_hashes {
        println!("{}", hash);
    }
}

fn first_peer(peers: &[Peer]) -> Result<Peer> {
    peers
        .first()
        .copied()
        .ok_or_else(|| anyhow!("tracker returned no peers"))
}

/// Resolve a magnet link into a metafile by fetching the metadata from
/// the first peer of the swarm. The connection is returned so single-piece
/// commands can keep using it.
fn fetch_magnet_metadata(link: &str) -> Result<(MetaFile, Client)> {
    let magnet = Magnet::parse(link)?;
    let peers = tracker::discover_peers(&magnet.tracker_url, &magnet.info_hash, 1)?;

    let mut client = Client::connect_with_extensions(first_peer(&peers)?, magnet.info_hash)?;
    let info = client.request_metadata()?;

    let mf = MetaFile::from_parts(&magnet.tracker_url, &info)?;

    // The fetched dictionary must hash to the id we asked for
    if mf.info.info_hash != magnet.info_hash {
        bail!("peer sent metadata that does not match the magnet info hash");
    }

    Ok((mf, client))
}

/// Download one piece over an already handshaken connection.
fn download_single_piece(mf: &MetaFile, client: &mut Client, index: u32) -> Result<Vec<u8>> {
    if index >= mf.info.piece_count() {
        bail!(
            "piece index {} out of bounds for {} pieces",
            index,
            mf.info.piece_count()
        );
    }

    client.pre_download()?;

    let work = PieceWork::new(
        index,
        mf.info.piece_hashes[index as usize].clone(),
        mf.info.piece_len_at(index),
    );

    client.download_piece(&work)
}

/// Write a downloaded buffer to the output path, truncating any existing
/// file.
fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    let mut file =
        File::create(path).map_err(|e| anyhow!("could not create output file {:?}: {}", path, e))?;

    file.write_all(data)
        .map_err(|e| anyhow!("could not write output file {:?}: {}", path, e))?;

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
