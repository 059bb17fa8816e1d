//! gitsql - git object and reference storage in SQLite
//!
//! Command-line front end for creating a store, writing and reading objects,
//! managing references and importing packs.

use std::error::Error;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use git2::{ObjectType, Oid};
use gitsql::db::{self, StoreConfig};
use gitsql::storage::{
    ObjectBackend, OidPrefix, RawObject, RefBackend, Reference, ReferenceTarget,
    TransferProgress, OID_HEXSZ,
};
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn Error>>;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // Parse global options up to the command name.
    let mut database: Option<PathBuf> = None;
    let mut verbose = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-d" | "--database" => {
                i += 1;
                match args.get(i) {
                    Some(path) => database = Some(PathBuf::from(path)),
                    None => {
                        eprintln!("Missing value for {}", args[i - 1]);
                        return ExitCode::FAILURE;
                    }
                }
            }
            "-v" | "--verbose" => {
                verbose = true;
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("gitsql v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown option: {}", arg);
                return ExitCode::FAILURE;
            }
            _ => break,
        }
        i += 1;
    }

    init_tracing(verbose);

    let Some(command) = args.get(i) else {
        print_help();
        return ExitCode::FAILURE;
    };
    let rest = &args[i + 1..];

    let config = match database {
        Some(path) => StoreConfig::new(path),
        None if std::env::var_os("GITSQL_DATABASE").is_some() => match StoreConfig::from_env() {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => StoreConfig::default(),
    };

    let result = match command.as_str() {
        "init" => cmd_init(&config),
        "hash-object" => cmd_hash_object(&config, rest),
        "cat-file" => cmd_cat_file(&config, rest),
        "show-ref" => cmd_show_ref(&config, rest),
        "update-ref" => cmd_update_ref(&config, rest),
        "delete-ref" => cmd_delete_ref(&config, rest),
        "index-pack" => cmd_index_pack(&config, rest),
        "config" => cmd_config(&config),
        other => {
            eprintln!("Unknown command: {}", other);
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "gitsql=debug" } else { "gitsql=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

fn print_help() {
    println!("gitsql - git object and reference storage in SQLite");
    println!();
    println!("Usage: gitsql [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("Options:");
    println!("  -d, --database PATH    Path to the store (default: $GITSQL_DATABASE or gitsql.db)");
    println!("  -v, --verbose          Enable debug logging");
    println!("  -h, --help             Show this help message");
    println!("  --version              Show version");
    println!();
    println!("Commands:");
    println!("  init                                   Create the object and reference tables");
    println!("  hash-object [-w] [-t TYPE] FILE        Compute an object id, optionally storing it");
    println!("  cat-file (-t|-s|-p) OID                Show type, size or content of an object");
    println!("  show-ref [GLOB] [--json]               List references");
    println!("  update-ref [-f] NAME OID               Point a reference at an object");
    println!("  update-ref [-f] NAME --symbolic REF    Point a reference at another reference");
    println!("  delete-ref NAME                        Remove a reference");
    println!("  index-pack FILE                        Import a packfile");
    println!("  config                                 Print the effective configuration");
    println!();
    println!("OID may be abbreviated to any unambiguous prefix. FILE may be '-' for stdin.");
}

fn cmd_init(config: &StoreConfig) -> CliResult {
    db::create(config)?;
    println!("Initialized empty store in {}", config.path().display());
    Ok(())
}

fn cmd_hash_object(config: &StoreConfig, args: &[String]) -> CliResult {
    let mut write = false;
    let mut kind = ObjectType::Blob;
    let mut file: Option<&str> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-w" => write = true,
            "-t" => {
                i += 1;
                let name = args.get(i).ok_or("-t needs a type")?;
                kind = ObjectType::from_str(name)
                    .filter(|kind| *kind != ObjectType::Any)
                    .ok_or_else(|| format!("unknown object type: {}", name))?;
            }
            arg => file = Some(arg),
        }
        i += 1;
    }

    let data = read_input(file.ok_or("hash-object needs a file")?)?;
    let oid = if write {
        let backends = db::open_or_create(config)?;
        backends.odb.write(&data, kind)?
    } else {
        Oid::hash_object(kind, &data)?
    };
    println!("{}", oid);
    Ok(())
}

fn cmd_cat_file(config: &StoreConfig, args: &[String]) -> CliResult {
    let [mode, spec] = args else {
        return Err("usage: cat-file (-t|-s|-p) OID".into());
    };
    let backends = db::open(config)?;
    let odb = &backends.odb;

    match mode.as_str() {
        "-t" | "-s" if spec.len() == OID_HEXSZ => {
            let header = odb.read_header(&Oid::from_str(spec)?)?;
            if mode == "-t" {
                println!("{}", header.kind);
            } else {
                println!("{}", header.size);
            }
        }
        "-t" => println!("{}", resolve(odb, spec)?.header().kind),
        "-s" => println!("{}", resolve(odb, spec)?.header().size),
        "-p" => {
            let object = resolve(odb, spec)?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(&object.data)?;
            stdout.flush()?;
        }
        other => return Err(format!("unknown cat-file mode: {}", other).into()),
    }
    Ok(())
}

/// Read an object by full id or by unambiguous prefix.
fn resolve(odb: &dyn ObjectBackend, spec: &str) -> Result<RawObject, Box<dyn Error>> {
    if spec.len() == OID_HEXSZ {
        return Ok(odb.read(&Oid::from_str(spec)?)?);
    }
    let prefix = OidPrefix::from_hex(spec)?;
    let padded = format!("{:0<width$}", spec, width = OID_HEXSZ);
    let (_, object) = odb.read_prefix(&Oid::from_str(&padded)?, prefix.nibbles())?;
    Ok(object)
}

fn cmd_show_ref(config: &StoreConfig, args: &[String]) -> CliResult {
    let mut json = false;
    let mut glob: Option<&str> = None;
    for arg in args {
        match arg.as_str() {
            "--json" => json = true,
            other => glob = Some(other),
        }
    }

    let backends = db::open(config)?;
    let refs = backends.refdb.iterate(glob)?;

    if json {
        let rows: Vec<serde_json::Value> = refs
            .map(|reference| match reference.target() {
                ReferenceTarget::Direct(oid) => serde_json::json!({
                    "name": reference.name(),
                    "oid": oid.to_string(),
                }),
                ReferenceTarget::Symbolic(target) => serde_json::json!({
                    "name": reference.name(),
                    "symref": target,
                }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for reference in refs {
            println!("{}", reference);
        }
    }
    Ok(())
}

fn cmd_update_ref(config: &StoreConfig, args: &[String]) -> CliResult {
    let mut force = false;
    let mut symbolic = false;
    let mut positional = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-f" | "--force" => force = true,
            "--symbolic" => symbolic = true,
            other => positional.push(other),
        }
    }
    let [name, target] = positional.as_slice() else {
        return Err("usage: update-ref [-f] NAME (OID | --symbolic REF)".into());
    };

    let backends = db::open(config)?;
    let reference = if symbolic {
        Reference::symbolic(*name, *target)
    } else {
        Reference::direct(*name, Oid::from_str(target)?)
    };
    backends.refdb.write(&reference, force)?;
    println!("{}", reference);
    Ok(())
}

fn cmd_delete_ref(config: &StoreConfig, args: &[String]) -> CliResult {
    let [name] = args else {
        return Err("usage: delete-ref NAME".into());
    };
    let backends = db::open(config)?;
    backends.refdb.delete(name)?;
    Ok(())
}

fn cmd_index_pack(config: &StoreConfig, args: &[String]) -> CliResult {
    let [file] = args else {
        return Err("usage: index-pack FILE".into());
    };
    let backends = db::open(config)?;

    let progress = |stats: &TransferProgress| {
        tracing::debug!(
            received = stats.received_objects,
            indexed = stats.indexed_objects,
            total = stats.total_objects,
            "indexing"
        );
        true
    };
    let mut writer = backends.odb.open_bulk_import(Some(Box::new(progress)))?;

    if file == "-" {
        io::copy(&mut io::stdin().lock(), &mut writer)?;
    } else {
        io::copy(&mut File::open(file)?, &mut writer)?;
    }
    let summary = writer.commit()?;

    println!(
        "pack {}: {} objects, {} new",
        summary.pack_name, summary.objects, summary.inserted
    );
    Ok(())
}

fn cmd_config(config: &StoreConfig) -> CliResult {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn read_input(file: &str) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    if file == "-" {
        io::stdin().lock().read_to_end(&mut data)?;
    } else {
        File::open(file)?.read_to_end(&mut data)?;
    }
    Ok(data)
}
