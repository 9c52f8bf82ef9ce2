mod logging;

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Parser;
use fs_err as fs;
use rayon::prelude::*;
use tracing::instrument;

use logging::*;
use ulink::compression::{decompress_whole, parse_uncompressed_size};
use ulink::error::error_kind;
use ulink::linker_load::LinkerStatus;
use ulink::linker_save::{SaveOptions, save_package};
use ulink::ser::Archive;
use ulink::summary::FPackageFileSummary;
use ulink::{Config, FSPackageSource, LinkerLoad, LoadContext, LoadFlags};

#[derive(Parser, Debug)]
struct ActionInfo {
    #[arg(index = 1, required = true)]
    files: Vec<PathBuf>,
}

#[derive(Parser, Debug)]
struct ActionDump {
    #[arg(index = 1)]
    file: PathBuf,
    #[arg(long)]
    names: bool,
    #[arg(long)]
    imports: bool,
    #[arg(long)]
    exports: bool,
    #[arg(long)]
    depends: bool,
    #[arg(long)]
    guids: bool,
}

#[derive(Parser, Debug)]
struct ActionVerify {
    /// Directory searched for packages
    #[arg(index = 1)]
    dir: PathBuf,
    #[arg(index = 2)]
    package: String,
}

#[derive(Parser, Debug)]
struct ActionResave {
    #[arg(index = 1)]
    dir: PathBuf,
    #[arg(index = 2)]
    package: String,
    #[arg(index = 3)]
    output: PathBuf,
    /// Write the opposite byte order
    #[arg(long)]
    swap: bool,
    /// Store everything after the summary as zlib chunks
    #[arg(long)]
    compress: bool,
}

#[derive(Parser, Debug)]
struct ActionDecompress {
    /// Fully compressed package with a `.uncompressed_size` sidecar
    #[arg(index = 1)]
    file: PathBuf,
    #[arg(index = 2)]
    output: PathBuf,
}

#[derive(Parser, Debug)]
enum Action {
    /// Print the summary and table counts of packages
    Info(ActionInfo),
    /// List the tables of a package
    Dump(ActionDump),
    /// Load a package and verify its imports
    Verify(ActionVerify),
    /// Load every object of a package and save it again
    Resave(ActionResave),
    /// Expand a fully compressed package
    Decompress(ActionDecompress),
}

#[derive(Parser, Debug)]
struct Args {
    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,
    /// Print per-object detail
    #[arg(long, global = true, default_value = "false")]
    debug: bool,
    #[command(subcommand)]
    action: Action,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let log = Log::new(args.verbose, args.debug);

    let result = match args.action {
        Action::Info(action) => action_info(action, &log),
        Action::Dump(action) => action_dump(action, config, &log),
        Action::Verify(action) => action_verify(action, config, &log),
        Action::Resave(action) => action_resave(action, config, &log),
        Action::Decompress(action) => action_decompress(action, &log),
    };
    log.finish_progress();
    result.map_err(|err| {
        let kind = error_kind(&err);
        err.context(format!("{kind:?} error"))
    })
}

fn read_summary(path: &Path) -> Result<FPackageFileSummary> {
    let data = fs::read(path)?;
    let mut ar = Archive::new(Cursor::new(data));
    FPackageFileSummary::read(&mut ar, &path.display().to_string())
}

fn action_info(args: ActionInfo, log: &Log) -> Result<()> {
    let reports = args
        .files
        .par_iter()
        .map(|path| -> Result<String> {
            let summary = read_summary(path).with_context(|| path.display().to_string())?;
            let mut out = format!("{}\n", path.display());
            out += &format!("  version      {} / {}\n", summary.file_version, summary.licensee_version);
            out += &format!("  engine       {}\n", summary.engine_version);
            out += &format!("  flags        {:?}\n", summary.package_flags);
            out += &format!("  folder       {}\n", summary.folder_name);
            out += &format!("  guid         {}\n", summary.guid);
            out += &format!("  names        {} @ {}\n", summary.name_count, summary.name_offset);
            out += &format!("  imports      {} @ {}\n", summary.import_count, summary.import_offset);
            out += &format!("  exports      {} @ {}\n", summary.export_count, summary.export_offset);
            out += &format!(
                "  guids        {} import levels, {} exports\n",
                summary.import_guids_count, summary.export_guids_count
            );
            out += &format!("  header size  {}\n", summary.total_header_size);
            out += &format!("  generations  {}\n", summary.generations.len());
            if !summary.compressed_chunks.is_empty() {
                out += &format!(
                    "  compressed   {:?}, {} chunks\n",
                    summary.compression_flags,
                    summary.compressed_chunks.len()
                );
            }
            Ok(out)
        })
        .collect::<Vec<_>>();
    for report in reports {
        log!(log, "{}", report?.trim_end());
    }
    Ok(())
}

/// Create a linker for `file` without verifying its imports.
fn open_linker(ctx: &mut LoadContext, file: &Path) -> Result<ulink::LinkerId> {
    let name = file.display().to_string();
    let id = ctx.create_linker_async(None, &name, LoadFlags::NO_VERIFY)?;
    while ctx.tick(id, None)? != LinkerStatus::Done {}
    Ok(id)
}

fn source_for(file: &Path) -> FSPackageSource {
    FSPackageSource::new(file.parent().unwrap_or(Path::new(".")))
}

fn action_dump(args: ActionDump, config: Config, log: &Log) -> Result<()> {
    let mut ctx = LoadContext::new(config, Arc::new(source_for(&args.file)))?;
    let id = open_linker(&mut ctx, &args.file)?;
    let linker = ctx.linker(id)?;

    let all = !(args.names || args.imports || args.exports || args.depends || args.guids);
    if all || args.names {
        dump_names(linker, log);
    }
    if all || args.imports {
        dump_imports(linker, log);
    }
    if all || args.exports {
        dump_exports(linker, log);
    }
    if all || args.depends {
        log!(log, "depends ({}):", linker.depends_map.len());
        for (i, depends) in linker.depends_map.iter().enumerate() {
            let list: Vec<String> = depends.iter().map(|d| linker.index_to_name(*d).to_string()).collect();
            log!(log, "  {:>5} {}: {}", i, linker.export_map[i].object_name, list.join(", "));
        }
    }
    if all || args.guids {
        log!(log, "import guids ({} levels):", linker.import_guids.len());
        for level in &linker.import_guids {
            log!(log, "  {} ({} guids)", level.level_name, level.guids.len());
            for guid in &level.guids {
                verbose!(log, "    {guid}");
            }
        }
        log!(log, "export guids ({}):", linker.export_guids_awaiting_lookup.len());
        for guid in &linker.export_guids_awaiting_lookup {
            log!(log, "  {} -> {}", guid.guid, guid.export_index);
        }
    }
    Ok(())
}

fn dump_names(linker: &LinkerLoad, log: &Log) {
    log!(log, "names ({}):", linker.name_map.len());
    for (i, name) in linker.name_map.iter().enumerate() {
        log!(log, "  {i:>5} {name}");
    }
}

fn dump_imports(linker: &LinkerLoad, log: &Log) {
    log!(log, "imports ({}):", linker.import_map.len());
    for (i, import) in linker.import_map.iter().enumerate() {
        log!(log, "  {:>5} {}", i, linker.import_full_name(i));
        debug!(log, "        package={} outer={}", import.class_package, import.outer_index);
    }
}

fn dump_exports(linker: &LinkerLoad, log: &Log) {
    log!(log, "exports ({}):", linker.export_map.len());
    for (i, export) in linker.export_map.iter().enumerate() {
        log!(log, "  {:>5} {}", i, linker.export_full_name(i));
        verbose!(log, "        offset={} size={} flags={:?}", export.serial_offset, export.serial_size, export.object_flags);
        debug!(
            log,
            "        class={} super={} outer={} archetype={} export_flags={:?}",
            export.class_index,
            export.super_index,
            export.outer_index,
            export.archetype_index,
            export.export_flags
        );
    }
}

#[instrument(skip_all)]
fn action_verify(args: ActionVerify, config: Config, log: &Log) -> Result<()> {
    let mut ctx = LoadContext::new(config, Arc::new(FSPackageSource::new(&args.dir)))?;
    let (_bar, sink) = log.linker_progress();
    ctx.set_progress(Some(sink));

    let root = ctx.load_package(&args.package, LoadFlags::empty())?;
    let Some(id) = ctx.linker_for(root) else {
        bail!("{} has no linker after loading", args.package);
    };
    let linker = ctx.linker(id)?;
    let unresolved: Vec<usize> = (0..linker.import_map.len())
        .filter(|&i| linker.import_map[i].x_object.is_none())
        .collect();
    for &i in &unresolved {
        log!(log, "unresolved: {}", linker.import_full_name(i));
    }
    let loaded = linker.export_map.iter().filter(|e| e.object.is_some()).count();
    log!(
        log,
        "{}: {}/{} imports resolved, {}/{} exports loaded",
        linker.filename,
        linker.import_map.len() - unresolved.len(),
        linker.import_map.len(),
        loaded,
        linker.export_map.len()
    );
    verbose!(log, "{} linkers open", ctx.linkers().count());
    Ok(())
}

#[instrument(skip_all)]
fn action_resave(args: ActionResave, config: Config, log: &Log) -> Result<()> {
    let mut ctx = LoadContext::new(config, Arc::new(FSPackageSource::new(&args.dir)))?;
    let (_bar, sink) = log.linker_progress();
    ctx.set_progress(Some(sink));

    let root = ctx.load_package(&args.package, LoadFlags::empty())?;
    let options = SaveOptions {
        force_byte_swapping: args.swap,
        compress: args.compress,
        ..Default::default()
    };
    let filename = args.output.display().to_string();
    let data = save_package(&mut ctx, root, &filename, options)?;
    fs::write(&args.output, &data)?;
    log!(log, "wrote {} ({} bytes)", args.output.display(), data.len());
    Ok(())
}

fn action_decompress(args: ActionDecompress, log: &Log) -> Result<()> {
    let data = fs::read(&args.file)?;
    let mut sidecar = args.file.clone().into_os_string();
    sidecar.push(".uncompressed_size");
    let expected = parse_uncompressed_size(&fs::read(&sidecar)?)
        .with_context(|| format!("bad sidecar {}", Path::new(&sidecar).display()))?;
    let output = decompress_whole(&data, expected)?;
    fs::write(&args.output, &output)?;
    log!(log, "{} -> {} ({} bytes)", args.file.display(), args.output.display(), output.len());
    Ok(())
}
