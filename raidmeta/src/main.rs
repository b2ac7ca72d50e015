// Copyright 2023 Oxide Computer Company
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use slog::{info, o, Logger};

use raidmeta::chunk::{chunk_range, classify};
use raidmeta::*;
use raidmeta_common::read_toml;

/// Inspect and exercise RAID group chunk metadata
#[derive(Debug, Parser)]
#[clap(name = "raidmeta", term_width = 80)]
#[clap(about = "RAID group chunk metadata tool", long_about = None)]
struct Args {
    /// Group configuration (toml).  Defaults are used when not given.
    #[clap(short, long, global = true, action)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warning, error, critical
    #[clap(long, global = true, default_value = "info", action)]
    log_level: String,

    #[clap(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Print the non-paged record's field offsets.
    Layout,
    /// Resolve a per-disk LBA range to its chunks and area.
    Classify {
        #[clap(long, action)]
        lba: u64,

        #[clap(long, default_value = "1", action)]
        blocks: u64,
    },
    /// Print the metadata of metadata geometry.
    Mdd,
    /// Run a paged reconstruction of an encrypted group against in-memory
    /// metadata.
    Demo {
        /// Chunks that have been rekeyed when the records are lost.
        #[clap(long, default_value = "10", action)]
        rekeyed: u64,

        /// Records lost after the rekeyed chunks.
        #[clap(long, default_value = "3", action)]
        lost: u64,

        /// Leave the lost chunks under the old key.
        #[clap(long, action)]
        old_key: bool,

        /// Also print the resulting non-paged record as json.
        #[clap(long, action)]
        json: bool,
    },
}

fn parse_level(s: &str) -> Result<slog::Level> {
    match s.parse::<slog::Level>() {
        Ok(level) => Ok(level),
        Err(_) => bail!("unknown log level {}", s),
    }
}

fn load_options(config: Option<&PathBuf>) -> Result<GroupOptions> {
    match config {
        Some(path) => read_toml(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(GroupOptions::default()),
    }
}

fn layout() -> Result<()> {
    let mut fields = vec![
        NonPagedField::Version,
        NonPagedField::NpState,
        NonPagedField::OperationBitmask,
        NonPagedField::RebuildLoggingBitmask,
    ];
    for i in 0..MAX_REBUILD_POSITIONS {
        fields.push(NonPagedField::RebuildCheckpoint(i));
        fields.push(NonPagedField::RebuildPosition(i));
    }
    fields.extend([
        NonPagedField::VerifyCheckpoint(VerifyKind::ReadOnly),
        NonPagedField::VerifyCheckpoint(VerifyKind::ReadWrite),
        NonPagedField::VerifyCheckpoint(VerifyKind::Error),
        NonPagedField::JournalVerifyCheckpoint,
        NonPagedField::VerifyCheckpoint(VerifyKind::IncompleteWrite),
        NonPagedField::VerifyCheckpoint(VerifyKind::System),
        NonPagedField::MddSlot(0),
        NonPagedField::NpFlags,
        NonPagedField::GlitchingDisks,
        NonPagedField::RekeyCheckpoint,
        NonPagedField::EncryptionFlags,
        NonPagedField::DriveTier,
        NonPagedField::ExtendedFlags,
    ]);

    println!("{:>6} {:>5}  FIELD", "OFFSET", "SIZE");
    for f in fields {
        println!("{:>6} {:>5}  {:?}", f.offset(), f.size(), f);
    }
    println!(
        "record size {} bytes, {} mdd slots",
        nonpaged::NONPAGED_RECORD_SIZE,
        MDD_SLOTS
    );
    Ok(())
}

fn classify_range(def: &GroupDefinition, lba: u64, blocks: u64) -> Result<()> {
    let range = chunk_range(def, lba, blocks)?;
    let area = classify(def, range)?;
    println!(
        "lba {:#x}+{:#x}: chunks {:#x}..={:#x} ({}) in {}",
        lba,
        blocks,
        range.start,
        range.last(),
        range.count,
        area
    );
    if area == ChunkArea::PagedMetadata && def.has_paged_metadata() {
        let mdd = MddMap::new(def);
        let first = mdd.physical_to_slot(range.start)?;
        let last = mdd.physical_to_slot(range.last())?;
        println!("mdd slots {}..={}", first, last);
    }
    Ok(())
}

fn mdd(def: &GroupDefinition) -> Result<()> {
    let mdd = MddMap::new(def);
    println!("metadata chunks  {}", mdd.metadata_chunks());
    println!("chunks per slot  {}", mdd.chunks_per_slot());
    let slots = mdd.slot_count()?;
    println!("slots in use     {}", slots);
    for slot in 0..slots {
        let r = mdd.slot_to_physical_range(slot)?;
        println!("  slot {:>2}: chunks {:#x}..={:#x}", slot, r.start, r.last());
    }
    Ok(())
}

async fn demo(
    log: &Logger,
    def: GroupDefinition,
    rekeyed: u64,
    lost: u64,
    old_key: bool,
    json: bool,
) -> Result<()> {
    let exported = def.exported_chunks();
    if rekeyed + lost > exported {
        bail!("{} chunks do not fit in {}", rekeyed + lost, exported);
    }

    let md = Arc::new(InMemoryMetadata::new(&def));
    let verifier = Arc::new(InMemoryVerifier::new());
    let chunk_size = def.chunk_size();
    let group =
        RaidGroup::create(log, def, md.clone(), verifier.clone()).await?;

    for chunk in 0..rekeyed {
        md.set_record(
            chunk,
            PagedChunkRecord {
                rekey: true,
                ..PagedChunkRecord::initialized()
            },
        );
    }
    md.invalidate(rekeyed..rekeyed + lost);
    if old_key {
        for chunk in rekeyed..rekeyed + lost {
            verifier.set_result(
                chunk * chunk_size,
                VerifyReport {
                    u_crc_multi_count: chunk_size,
                    c_crc_count: 0,
                },
            );
        }
    }

    group.reconstruct_all_paged().await?;

    let records = group.read_chunk_info(0, exported * chunk_size).await?;
    let rekey_checkpoint = group.store().rekey_checkpoint();
    println!("rekey checkpoint {:#x}", rekey_checkpoint);
    println!("verifies issued  {}", verifier.calls().len());
    for (chunk, r) in records.iter().enumerate().take((rekeyed + lost + 1) as usize) {
        println!(
            "  chunk {:>3}: valid {} rekey {} verify {:#x} nr {:#x}",
            chunk,
            r.valid as u8,
            r.rekey as u8,
            r.verify.0,
            r.needs_rebuild
        );
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&group.store().snapshot())?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log = build_logger_with_level(parse_level(&args.log_level)?)
        .new(o!("task" => "raidmeta"));
    let mut opts = load_options(args.config.as_ref())?;

    match args.action {
        Action::Layout => layout(),
        Action::Classify { lba, blocks } => {
            classify_range(&GroupDefinition::from_options(&opts)?, lba, blocks)
        }
        Action::Mdd => mdd(&GroupDefinition::from_options(&opts)?),
        Action::Demo {
            rekeyed,
            lost,
            old_key,
            json,
        } => {
            opts.encrypted = true;
            let def = GroupDefinition::from_options(&opts)?;
            info!(log, "demo group {}", def.uuid());
            demo(&log, def, rekeyed, lost, old_key, json).await
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn options_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "encrypted = true\nchunk_size = 1024").unwrap();
        drop(f);

        let loaded = load_options(Some(&path)).unwrap();
        assert!(loaded.encrypted);
        assert_eq!(loaded.chunk_size, 1024);
        assert!(load_options(Some(&dir.path().join("missing.toml"))).is_err());
        assert!(!load_options(None).unwrap().encrypted);
    }

    #[test]
    fn log_levels() {
        assert_eq!(parse_level("debug").unwrap(), slog::Level::Debug);
        assert!(parse_level("loud").is_err());
    }

    #[tokio::test]
    async fn demo_runs() {
        let opts = GroupOptions {
            encrypted: true,
            ..Default::default()
        };
        let def = GroupDefinition::from_options(&opts).unwrap();
        let log = build_logger_with_level(slog::Level::Error);
        demo(&log, def.clone(), 10, 3, true, false).await.unwrap();
        assert!(demo(&log, def, 60, 10, false, false).await.is_err());
    }
}
