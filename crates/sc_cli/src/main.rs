use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::seq::SliceRandom;
use tracing::info;

use sc_crypto::{
    kdf::{self, HashAlgorithm},
    Conversation, KeyPair, MemoryPrekeyStore, RatchetConfig, XChaChaCipher,
};
use sc_proto::{Envelope, InitData, PaddingMode};

#[derive(Parser)]
#[command(name = "sc")]
#[command(about = "Secure Channel session core driver", long_about = None)]
struct Cli {
    /// Ratchet configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a local two-party conversation through serialised envelopes
    Demo {
        /// Messages Alice sends before Bob replies
        #[arg(short, long, default_value = "5")]
        messages: usize,

        /// Deliver Alice's burst in random order
        #[arg(long)]
        shuffle: bool,

        /// Padding mode: none, buckets, maximum
        #[arg(long, default_value = "buckets")]
        padding: PaddingMode,

        /// One-time prekeys Bob publishes
        #[arg(long, default_value = "1")]
        one_time_keys: usize,
    },

    /// Derive key material with HKDF
    Kdf {
        /// Input keying material (hex)
        #[arg(long)]
        ikm: String,

        /// Salt (hex); omitted means HashLen zero bytes
        #[arg(long)]
        salt: Option<String>,

        /// Context string
        #[arg(long, default_value = "")]
        info: String,

        /// Output length in bytes
        #[arg(short, long, default_value = "32")]
        len: usize,

        /// sha256 or sha512
        #[arg(long, default_value = "sha256")]
        hash: HashAlgorithm,
    },

    /// Print the effective ratchet configuration
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sc_cli=info,sc_crypto=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => RatchetConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RatchetConfig::default(),
    };

    match cli.command {
        Commands::Demo {
            messages,
            shuffle,
            padding,
            one_time_keys,
        } => demo(&config, messages, shuffle, padding, one_time_keys),
        Commands::Kdf {
            ikm,
            salt,
            info,
            len,
            hash,
        } => {
            let ikm = hex::decode(&ikm).context("--ikm is not valid hex")?;
            let salt = salt
                .map(|s| hex::decode(s).context("--salt is not valid hex"))
                .transpose()?;
            let okm = kdf::hkdf(hash, &ikm, len, info.as_bytes(), salt.as_deref())?;
            println!("{}", hex::encode(&*okm));
            Ok(())
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn demo(
    config: &RatchetConfig,
    messages: usize,
    shuffle: bool,
    padding: PaddingMode,
    one_time_keys: usize,
) -> Result<()> {
    if messages == 0 {
        bail!("--messages must be at least 1");
    }

    let alice_identity = KeyPair::generate();
    let bob_store = MemoryPrekeyStore::generate(one_time_keys);
    let bundle = bob_store.publish_bundle();
    info!(
        bob = %bob_store.identity_public().short_id(),
        one_time = bundle.has_one_time_pre_key(),
        "bundle published"
    );

    let (mut alice, payload) = Conversation::initiate(&alice_identity, &bundle, config)?;
    let mut init = Some(InitData::new(alice_identity.public, &payload));

    let mut wire = Vec::with_capacity(messages);
    for i in 0..messages {
        let text = format!("alice #{i}");
        let envelope = Envelope::seal(&mut alice, &XChaChaCipher, text.as_bytes(), padding, init.take())?;
        wire.push(envelope.to_json()?);
    }

    // The session-opening envelope must reach Bob first.
    let (first, rest) = wire
        .split_first_mut()
        .ok_or_else(|| anyhow!("no envelopes produced"))?;
    if shuffle {
        rest.shuffle(&mut rand::thread_rng());
    }

    let opening = Envelope::from_json(first)?;
    let init = opening
        .init
        .as_ref()
        .ok_or_else(|| anyhow!("first envelope carries no handshake"))?;
    let mut bob = Conversation::respond(
        &bob_store,
        &init.sender_identity,
        &init.payload()?,
        opening.session_id.clone(),
        config,
    )?;
    println!("session {}", bob.session_id());

    for json in std::iter::once(&*first).chain(rest.iter()) {
        let envelope = Envelope::from_json(json)?;
        let header = envelope.decode_header()?;
        let plaintext = envelope.open(&mut bob, &XChaChaCipher)?;
        println!(
            "bob   <- n={:<3} pn={:<3} {:>6} B  {}",
            header.message_number,
            header.previous_chain_length,
            envelope.decode_ciphertext()?.len(),
            String::from_utf8_lossy(&plaintext)
        );
    }

    let reply = Envelope::seal(&mut bob, &XChaChaCipher, b"bob: got them all", padding, None)?;
    let reply = Envelope::from_json(&reply.to_json()?)?;
    let plaintext = reply.open(&mut alice, &XChaChaCipher)?;
    println!("alice <- {}", String::from_utf8_lossy(&plaintext));

    info!(
        skipped = bob.session().skipped_key_count(),
        remaining_one_time = bob_store.available_one_time_pre_keys(),
        "demo finished"
    );
    Ok(())
}
