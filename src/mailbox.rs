//! # Mailbox workflow
//!
//! The client side of the DHT: per-identity check-inbox loops and one
//! send-outbox loop, built from the engine's lookup/retrieve/store/delete
//! primitives.
//!
//! Checking: fetch every index packet stored under the identity hash (plus
//! the locally cached one), fetch the email packets the entries point at,
//! decrypt, verify the delete authorization against the envelope's delete
//! hash, save to the inbox, then ask the hosting peers to delete the packet
//! and its index entry.
//!
//! Sending: parse outbox files, canonicalize the address headers against
//! the address book, encrypt to the recipient, store the encrypted packet
//! under its content key and an index entry under the recipient's identity
//! hash, then move the file to the sent folder.
//!
//! Crypto and key material live behind the [`MailCrypto`] seam; the
//! workflow only sees opaque ciphertext and the stable identity hash.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::dht::DhtEngine;
use crate::identity::{Destination, IdentityHash};
use crate::packet::{
    EmailEncryptedPacket, IndexEntry, IndexPacket, PacketType, RecordType, ResponsePacket,
    StatusCode, StoreRequest,
};

/// Period of each identity's check-inbox loop.
pub const CHECK_EMAIL_INTERVAL: Duration = Duration::from_secs(300);

/// Period of the send-outbox loop.
pub const SEND_EMAIL_INTERVAL: Duration = Duration::from_secs(300);

/// How often the driver looks for newly added identities.
const IDENTITY_RESCAN_INTERVAL: Duration = Duration::from_secs(60);

const ADDRESS_B32_PREFIX: &str = "b32.";
const ADDRESS_B64_PREFIX: &str = "b64.";

/// First byte of a version-1 address payload.
const ADDRESS_FORMAT_V1: u8 = 1;

/// Per-identity encryption seam; the key material is external.
pub trait MailCrypto: Send + Sync {
    /// Algorithm id recorded in the encrypted packet envelope.
    fn algorithm(&self) -> u8;
    fn encrypt(&self, recipient: &Destination, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// A local mail identity: a public name, the overlay destination whose hash
/// indexes inbound mail, and the crypto backing it.
pub struct MailIdentity {
    pub public_name: String,
    pub destination: Destination,
    pub crypto: Arc<dyn MailCrypto>,
}

impl MailIdentity {
    pub fn hash(&self) -> IdentityHash {
        self.destination.hash()
    }
}

/// Maps public names and aliases to full Base64 address strings.
#[derive(Default)]
pub struct AddressBook {
    names: HashMap<String, String>,
    aliases: HashMap<String, String>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_name(&mut self, name: impl Into<String>, address: impl Into<String>) {
        self.names.insert(name.into(), address.into());
    }

    pub fn insert_alias(&mut self, alias: impl Into<String>, address: impl Into<String>) {
        self.aliases.insert(alias.into(), address.into());
    }

    pub fn address_for_name(&self, name: &str) -> Option<&str> {
        self.names.get(name).map(String::as_str)
    }

    pub fn address_for_alias(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }
}

/// The decrypted payload of an email packet: the delete authorization
/// followed by the MIME content. Publishing SHA-256 of the authorization in
/// the envelope lets only a legitimate reader authorize deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainEmailPacket {
    pub delete_auth: [u8; 32],
    pub content: Vec<u8>,
}

impl PlainEmailPacket {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.content.len());
        out.extend_from_slice(&self.delete_auth);
        out.extend_from_slice(&self.content);
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < 32 {
            return None;
        }
        let mut delete_auth = [0u8; 32];
        delete_auth.copy_from_slice(&buf[..32]);
        Some(Self {
            delete_auth,
            content: buf[32..].to_vec(),
        })
    }
}

/// A parsed mail file: RFC822-shaped headers and an opaque body.
#[derive(Debug, Clone)]
pub struct Email {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    path: Option<PathBuf>,
}

impl Email {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut headers = Vec::new();
        let mut offset = 0;
        loop {
            let rest = &bytes[offset..];
            let line_end = rest
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| offset + p)
                .unwrap_or(bytes.len());
            let line = std::str::from_utf8(&bytes[offset..line_end])
                .context("header is not UTF-8")?
                .trim_end_matches('\r');
            if line.is_empty() {
                offset = (line_end + 1).min(bytes.len());
                break;
            }
            let (name, value) = line
                .split_once(':')
                .with_context(|| format!("malformed header line {line:?}"))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
            if line_end == bytes.len() {
                offset = bytes.len();
                break;
            }
            offset = line_end + 1;
        }
        Ok(Self {
            headers,
            body: bytes[offset..].to_vec(),
            path: None,
        })
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_field(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        out
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }
}

/// Minimal RFC 4648 base32 decode; the version-1 address format allows it
/// alongside base64 and no crate in the stack covers it.
fn base32_decode(s: &str) -> Option<Vec<u8>> {
    let mut bits = 0u32;
    let mut nbits = 0u32;
    let mut out = Vec::with_capacity(s.len() * 5 / 8);
    for c in s.chars() {
        if c == '=' {
            break;
        }
        let value = match c {
            'A'..='Z' => c as u32 - 'A' as u32,
            'a'..='z' => c as u32 - 'a' as u32,
            '2'..='7' => c as u32 - '2' as u32 + 26,
            _ => return None,
        };
        bits = (bits << 5) | value;
        nbits += 5;
        if nbits >= 8 {
            nbits -= 8;
            out.push((bits >> nbits) as u8);
        }
    }
    Some(out)
}

/// Parse a recipient address into a destination.
///
/// Accepted forms, after unwrapping an optional `Display <...>` shell:
/// - version 1, prefixed: `b32.<base32>` or `b64.<base64>` of a payload
///   whose first byte is the format version, followed by the destination;
/// - version 0, raw: the whole string is the Base64 destination.
pub fn parse_address(address: &str) -> Option<Destination> {
    let address = address.trim();
    let address = match (address.find('<'), address.rfind('>')) {
        (Some(open), Some(close)) if open < close => &address[open + 1..close],
        _ => address,
    };

    if let Some(rest) = address.strip_prefix(ADDRESS_B32_PREFIX) {
        let bytes = base32_decode(rest)?;
        return parse_address_v1(&bytes);
    }
    if let Some(rest) = address.strip_prefix(ADDRESS_B64_PREFIX) {
        let bytes = BASE64.decode(rest).ok()?;
        return parse_address_v1(&bytes);
    }
    Destination::from_base64(address).ok()
}

fn parse_address_v1(bytes: &[u8]) -> Option<Destination> {
    if bytes.len() < 5 {
        warn!("malformed v1 address");
        return None;
    }
    if bytes[0] != ADDRESS_FORMAT_V1 {
        warn!(format = bytes[0], "unsupported address format");
        return None;
    }
    match Destination::from_bytes(&bytes[1..]) {
        Ok((dest, _)) => Some(dest),
        Err(e) => {
            warn!(error = %e, "undecodable v1 address");
            None
        }
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Proof-of-work token carried by store requests. Not validated by the
/// current server contract, so a fresh random stamp suffices.
fn hashcash_stamp() -> Vec<u8> {
    let mut salt = [0u8; 8];
    OsRng.fill_bytes(&mut salt);
    format!("1:20:{}:{}::", unix_now(), hex::encode(salt)).into_bytes()
}

pub struct MailDirs {
    pub inbox: PathBuf,
    pub outbox: PathBuf,
    pub sent: PathBuf,
}

pub struct MailboxWorker {
    engine: DhtEngine,
    identities: RwLock<Vec<Arc<MailIdentity>>>,
    address_book: AddressBook,
    dirs: MailDirs,
}

impl MailboxWorker {
    pub fn new(
        engine: DhtEngine,
        identities: Vec<Arc<MailIdentity>>,
        address_book: AddressBook,
        dirs: MailDirs,
    ) -> Self {
        Self {
            engine,
            identities: RwLock::new(identities),
            address_book,
            dirs,
        }
    }

    pub fn add_identity(&self, identity: Arc<MailIdentity>) {
        self.identities
            .write()
            .expect("identity list lock poisoned")
            .push(identity);
    }

    fn identities(&self) -> Vec<Arc<MailIdentity>> {
        self.identities
            .read()
            .expect("identity list lock poisoned")
            .clone()
    }

    /// Driver: keeps one check loop per identity and a single send loop
    /// alive, picking up identities that appear later. Child loops share the
    /// stop signal and finish their current round before exiting.
    pub async fn drive(self: Arc<Self>, stop: watch::Receiver<bool>) {
        let mut started: HashSet<String> = HashSet::new();
        let mut send_started = false;
        let mut children = Vec::new();
        let mut stop_rx = stop.clone();

        loop {
            let identities = self.identities();
            if identities.is_empty() {
                warn!("no mail identities, mailbox loops idle");
            } else {
                if !send_started {
                    let worker = self.clone();
                    let stop = stop.clone();
                    children.push(tokio::spawn(async move { worker.send_loop(stop).await }));
                    send_started = true;
                }
                for identity in identities {
                    if started.insert(identity.public_name.clone()) {
                        info!(name = %identity.public_name, "starting check task");
                        let worker = self.clone();
                        let stop = stop.clone();
                        children.push(tokio::spawn(async move {
                            worker.check_loop(identity, stop).await;
                        }));
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(IDENTITY_RESCAN_INTERVAL) => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        for child in children {
            let _ = child.await;
        }
        info!("mailbox worker stopped");
    }

    /// Check loop for one identity; the first round runs immediately.
    async fn check_loop(&self, identity: Arc<MailIdentity>, mut stop: watch::Receiver<bool>) {
        loop {
            self.check_email_round(&identity).await;
            tokio::select! {
                _ = tokio::time::sleep(CHECK_EMAIL_INTERVAL) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn send_loop(&self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SEND_EMAIL_INTERVAL) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
            self.send_email_round().await;
        }
    }

    pub async fn check_email_round(&self, identity: &MailIdentity) {
        let name = identity.public_name.as_str();
        let identity_hash = identity.hash();

        let mut index_packets = self.retrieve_index(&identity_hash).await;
        if let Some(local) = self
            .engine
            .store_backend()
            .get_index(identity_hash.as_bytes())
        {
            match IndexPacket::decode(&local) {
                Ok(packet) if !packet.entries.is_empty() => index_packets.push(packet),
                Ok(_) => {}
                Err(e) => warn!(name, error = %e, "local index packet undecodable"),
            }
        } else {
            debug!(name, "no local index packet");
        }
        debug!(name, count = index_packets.len(), "index packets");

        let email_packets = self.retrieve_email_packets(&index_packets).await;
        debug!(name, count = email_packets.len(), "mail packets");
        if email_packets.is_empty() {
            info!(name, "check round complete, no mail");
            return;
        }

        let emails = self.process_email(identity, &email_packets);
        let mut saved = 0usize;
        for (email, envelope, delete_auth) in emails {
            if let Err(e) = self.save_to_inbox(&email, &envelope.key) {
                warn!(name, error = %e, "cannot save email to inbox");
                continue;
            }
            saved += 1;

            // the hosting peers can drop the packet and its index entry now
            self.engine.delete_email(envelope.key, delete_auth).await;
            self.engine
                .delete_index_entry(identity_hash, envelope.key, delete_auth)
                .await;
        }
        info!(
            name,
            fetched = email_packets.len(),
            received = saved,
            "check round complete"
        );
    }

    /// Every index packet stored for this identity across the close peers.
    /// find_all rather than find_one: peers may hold incomplete entry sets,
    /// and the delete requests later want every holder.
    async fn retrieve_index(&self, identity_hash: &IdentityHash) -> Vec<IndexPacket> {
        let results = self.engine.find_all(identity_hash, RecordType::Index).await;
        if results.is_empty() {
            warn!(hash = %identity_hash, "no index found");
            return Vec::new();
        }

        let mut packets: HashMap<[u8; 32], IndexPacket> = HashMap::new();
        for response in &results {
            let Some(data) = self.response_data(response) else {
                continue;
            };
            if self.engine.store_backend().put(&data) {
                debug!("index packet cached");
            }
            match IndexPacket::decode(&data) {
                Ok(packet) if !packet.entries.is_empty() => {
                    packets.insert(packet.dest_hash, packet);
                }
                Ok(_) => warn!("index packet without entries"),
                Err(e) => warn!(error = %e, "undecodable index packet"),
            }
        }
        packets.into_values().collect()
    }

    /// Fetch the email packets the index entries point at, deduplicated by
    /// DHT key, local copies included.
    async fn retrieve_email_packets(
        &self,
        index_packets: &[IndexPacket],
    ) -> Vec<EmailEncryptedPacket> {
        let mut packets: HashMap<[u8; 32], EmailEncryptedPacket> = HashMap::new();

        for index in index_packets {
            for entry in &index.entries {
                if let Some(local) = self.engine.store_backend().get_email(&entry.key) {
                    match EmailEncryptedPacket::decode(&local) {
                        Ok(packet) if !packet.ciphertext.is_empty() => {
                            packets.insert(packet.key, packet);
                        }
                        _ => debug!("local email packet unusable"),
                    }
                }

                let key = IdentityHash::from_bytes(entry.key);
                let responses = self.engine.find_all(&key, RecordType::Email).await;
                for response in &responses {
                    let Some(data) = self.response_data(response) else {
                        continue;
                    };
                    if self.engine.store_backend().put(&data) {
                        debug!("email packet cached");
                    }
                    match EmailEncryptedPacket::decode(&data) {
                        Ok(packet) if !packet.ciphertext.is_empty() => {
                            packets.insert(packet.key, packet);
                        }
                        Ok(_) => warn!("email packet without payload"),
                        Err(e) => warn!(error = %e, "undecodable email packet"),
                    }
                }
            }
        }
        packets.into_values().collect()
    }

    /// Extract the data bytes of an OK response; logs and skips the rest.
    fn response_data(&self, response: &crate::batch::ReceivedPacket) -> Option<Vec<u8>> {
        if response.packet.packet_type != PacketType::Response {
            warn!(
                packet_type = ?response.packet.packet_type,
                version = response.packet.version,
                "non-response packet in batch"
            );
            return None;
        }
        let parsed = match ResponsePacket::decode(&response.packet.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "undecodable response payload");
                return None;
            }
        };
        if parsed.status != StatusCode::Ok {
            warn!(status = %parsed.status, "response status");
            return None;
        }
        if parsed.data.len() < 4 {
            warn!("response without payload, parsing skipped");
            return None;
        }
        Some(parsed.data)
    }

    /// Decrypt, verify the delete authorization, parse. Packets that fail
    /// any step are skipped, not fatal.
    fn process_email(
        &self,
        identity: &MailIdentity,
        packets: &[EmailEncryptedPacket],
    ) -> Vec<(Email, EmailEncryptedPacket, [u8; 32])> {
        let mut emails = Vec::new();
        for envelope in packets {
            if envelope.ciphertext.is_empty() {
                warn!("email packet is empty");
                continue;
            }
            let plaintext = match identity.crypto.decrypt(&envelope.ciphertext) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(error = %e, "cannot decrypt email packet");
                    continue;
                }
            };
            let Some(plain) = PlainEmailPacket::from_bytes(&plaintext) else {
                warn!("decrypted email packet too short");
                continue;
            };

            let mut digest = [0u8; 32];
            digest.copy_from_slice(&Sha256::digest(plain.delete_auth));
            if digest != envelope.delete_hash {
                warn!(
                    key = %hex::encode(&envelope.key[..8]),
                    "delete authorization does not match envelope"
                );
                continue;
            }

            match Email::parse(&plain.content) {
                Ok(email) => emails.push((email, envelope.clone(), plain.delete_auth)),
                Err(e) => warn!(error = %e, "undecodable mail content"),
            }
        }
        debug!(processed = emails.len(), "emails processed");
        emails
    }

    fn save_to_inbox(&self, email: &Email, key: &[u8; 32]) -> Result<()> {
        std::fs::create_dir_all(&self.dirs.inbox)?;
        let path = self
            .dirs
            .inbox
            .join(format!("{}.mail", hex::encode(&key[..16])));
        std::fs::write(&path, email.to_bytes())
            .with_context(|| format!("cannot write {}", path.display()))?;
        info!(path = %path.display(), "email saved to inbox");
        Ok(())
    }

    pub async fn send_email_round(&self) {
        let identities = self.identities();
        if identities.is_empty() {
            warn!("no identities, send round skipped");
            return;
        }

        let outbox = self.check_outbox();
        if outbox.is_empty() {
            return;
        }

        let mut sent = 0usize;
        for mut email in outbox {
            let Some(to) = email.field("To").map(str::to_string) else {
                warn!("outbox mail without To header");
                continue;
            };
            let Some(recipient) = parse_address(&to) else {
                warn!(to = %to, "cannot parse recipient, mail skipped this round");
                continue;
            };
            let sender = pick_sender(&email, &identities);

            if self.send_one_email(&mut email, &recipient, sender.as_ref()).await {
                sent += 1;
            }
        }
        info!(sent, "send round complete");
    }

    async fn send_one_email(
        &self,
        email: &mut Email,
        recipient: &Destination,
        sender: &MailIdentity,
    ) -> bool {
        // fresh delete authorization; its hash is published in the envelope
        let mut delete_auth = [0u8; 32];
        OsRng.fill_bytes(&mut delete_auth);
        let mut delete_hash = [0u8; 32];
        delete_hash.copy_from_slice(&Sha256::digest(delete_auth));
        email.set_field("X-I2PBote-Delete-Auth-Hash", &BASE64.encode(delete_hash));

        let plain = PlainEmailPacket {
            delete_auth,
            content: email.to_bytes(),
        };
        let ciphertext = match sender.crypto.encrypt(recipient, &plain.to_bytes()) {
            Ok(ciphertext) if !ciphertext.is_empty() => ciphertext,
            Ok(_) => {
                warn!("encrypted data is empty, mail skipped");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "cannot encrypt mail, skipped");
                return false;
            }
        };

        let key = EmailEncryptedPacket::compute_key(&ciphertext);
        let envelope = EmailEncryptedPacket {
            key,
            delete_hash,
            algorithm: sender.crypto.algorithm(),
            stored_time: 0,
            ciphertext,
        };
        email.set_field("X-I2PBote-DHT-Key", &BASE64.encode(key));

        // store the encrypted packet under its content key
        let store_email = StoreRequest {
            hashcash: hashcash_stamp(),
            data: envelope.encode(),
        };
        let acks = self
            .engine
            .store(&IdentityHash::from_bytes(key), RecordType::Email, &store_email)
            .await;
        if acks.is_empty() {
            warn!("email not sent, will retry next round");
            return false;
        }
        self.engine.store_backend().put(&envelope.encode());
        debug!(nodes = acks.len(), "email packet stored");

        // one index entry under the recipient's identity hash
        let index = IndexPacket {
            dest_hash: *recipient.hash().as_bytes(),
            entries: vec![IndexEntry {
                key,
                delete_hash,
                time: unix_now(),
            }],
        };
        let store_index = StoreRequest {
            hashcash: hashcash_stamp(),
            data: index.encode(),
        };
        let acks = self
            .engine
            .store(&recipient.hash(), RecordType::Index, &store_index)
            .await;
        if acks.is_empty() {
            warn!("index not stored, will retry next round");
            return false;
        }
        self.engine.store_backend().put(&index.encode());
        debug!(nodes = acks.len(), "index packet stored");

        email.set_field("X-I2PBote-Deleted", "false");
        if let Err(e) = self.move_to_sent(email) {
            warn!(error = %e, "cannot move mail to sent");
        }
        true
    }

    /// Load the outbox and canonicalize From/To against the local
    /// identities and address book. Files that fail stay for the next round.
    fn check_outbox(&self) -> Vec<Email> {
        let entries = match std::fs::read_dir(&self.dirs.outbox) {
            Ok(entries) => entries,
            Err(_) => {
                debug!("no outbox directory");
                return Vec::new();
            }
        };

        let mut emails = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot read outbox file");
                    continue;
                }
            };
            let mut email = match Email::parse(&bytes) {
                Ok(email) => email,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot parse outbox file");
                    continue;
                }
            };
            email.path = Some(path.clone());

            if email.field("From").unwrap_or("").is_empty()
                || email.field("To").unwrap_or("").is_empty()
            {
                warn!(path = %path.display(), "From or To header missing");
                continue;
            }
            if !self.canonicalize_headers(&mut email) {
                continue;
            }
            emails.push(email);
        }
        debug!(count = emails.len(), "outbox mails loaded");
        emails
    }

    /// Replace `Display <name@domain>` headers with full keys. From resolves
    /// against the local identities, To against the address book. Returns
    /// false when a replacement is needed but no address is known.
    fn canonicalize_headers(&self, email: &mut Email) -> bool {
        if let Some(from) = email.field("From").map(str::to_string) {
            if let Some((display_name, inner)) = split_display_address(&from) {
                let identities = self.identities();
                let resolved = identities
                    .iter()
                    .find(|id| id.public_name == display_name || id.public_name == inner)
                    .map(|id| id.destination.to_base64());
                match resolved {
                    Some(key) => {
                        email.set_field("From", &format!("{display_name} <{key}>"));
                    }
                    None => {
                        warn!(name = %display_name, "no identity for From header");
                        return false;
                    }
                }
            }
        }

        if let Some(to) = email.field("To").map(str::to_string) {
            if let Some((display_name, inner)) = split_display_address(&to) {
                let resolved = self
                    .address_book
                    .address_for_name(display_name)
                    .or_else(|| self.address_book.address_for_alias(inner))
                    .map(str::to_string);
                match resolved {
                    Some(address) => {
                        email.set_field("To", &format!("{display_name} <{address}>"));
                    }
                    None => {
                        warn!(name = %display_name, alias = %inner, "no address for To header");
                        return false;
                    }
                }
            }
        }
        true
    }

    fn move_to_sent(&self, email: &Email) -> Result<()> {
        let Some(path) = email.path() else {
            return Ok(());
        };
        std::fs::create_dir_all(&self.dirs.sent)?;
        let file_name = path
            .file_name()
            .context("outbox path without file name")?;
        let target = self.dirs.sent.join(file_name);
        // rewrite with the updated headers, then drop the outbox copy
        std::fs::write(&target, email.to_bytes())
            .with_context(|| format!("cannot write {}", target.display()))?;
        std::fs::remove_file(path)
            .with_context(|| format!("cannot remove {}", path.display()))?;
        info!(path = %target.display(), "mail moved to sent");
        Ok(())
    }
}

/// Split `Display <address@domain>` into (display, inner address). Headers
/// already holding a bare address return None.
fn split_display_address(value: &str) -> Option<(&str, &str)> {
    let open = value.find('<')?;
    let close = value.rfind('>')?;
    if close < open {
        return None;
    }
    let inner = &value[open + 1..close];
    if !inner.contains('@') {
        // already canonicalized to a full key
        return None;
    }
    let display = value[..open].trim();
    let inner = inner.split('@').next().unwrap_or(inner);
    Some((display, inner))
}

fn pick_sender(email: &Email, identities: &[Arc<MailIdentity>]) -> Arc<MailIdentity> {
    if let Some(from) = email.field("From") {
        let display = from.split('<').next().unwrap_or("").trim();
        for identity in identities {
            if identity.public_name == display {
                return identity.clone();
            }
        }
    }
    identities[0].clone()
}
