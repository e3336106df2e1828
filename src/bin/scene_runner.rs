use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use scanline8::scene::{Scene, SuiteEntry, parse_suite, run_scene};

#[derive(Debug, Clone, Default)]
struct Config {
    suite: PathBuf,
    contains: Vec<String>,
}

fn parse_args() -> Result<Config> {
    let mut cfg = Config::default();
    let mut suite = None;
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--contains" => {
                let value = args
                    .next()
                    .context("--contains requires a substring, e.g. --contains sprite0")?;
                cfg.contains.push(value.to_lowercase());
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other if other.starts_with("--") => {
                anyhow::bail!("unknown argument: {other}\nUse --help to view supported options.");
            }
            path => suite = Some(PathBuf::from(path)),
        }
    }

    cfg.suite = suite.context("missing suite path\nUse --help to view supported options.")?;
    Ok(cfg)
}

fn print_help() {
    println!(
        "Golden-frame scene runner for scanline8\n\n\
Usage:\n\
  scanline8_scenes <suite.xml> [options]\n\n\
Scene files are resolved relative to the suite file.\n\n\
Options:\n\
  --contains <substr>            Only run scenes whose file name contains this text (repeatable)\n\
  -h, --help                     Show this help\n"
    );
}

fn should_run(entry: &SuiteEntry, cfg: &Config) -> bool {
    if cfg.contains.is_empty() {
        return true;
    }
    let lower = entry.file.to_lowercase();
    cfg.contains.iter().any(|f| lower.contains(f))
}

fn run_single(entry: &SuiteEntry, root: &Path) -> Result<String> {
    let path = root.join(&entry.file);
    let mut scene = Scene::load(&path)?;
    if let Some(frames) = entry.frames {
        scene.frames = frames;
    }
    run_scene(&scene).with_context(|| format!("failed to render {}", path.display()))
}

fn main() -> Result<()> {
    let cfg = parse_args()?;

    let start = Instant::now();
    let xml = fs::read_to_string(&cfg.suite)
        .with_context(|| format!("failed to read suite XML: {}", cfg.suite.display()))?;
    let entries = parse_suite(&xml).with_context(|| format!("in {}", cfg.suite.display()))?;
    let root = cfg
        .suite
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let selected: Vec<&SuiteEntry> = entries.iter().filter(|e| should_run(e, &cfg)).collect();
    println!(
        "Running {} scene(s) from {}",
        selected.len(),
        cfg.suite.display()
    );

    let mut passed = 0usize;
    let mut failed = 0usize;

    for (idx, entry) in selected.iter().enumerate() {
        let label = format!("[{}/{}] {}", idx + 1, selected.len(), entry.file);
        match run_single(entry, &root) {
            Ok(digest) if digest == entry.sha1 => {
                passed += 1;
                println!("PASS {label}");
            }
            Ok(digest) => {
                failed += 1;
                println!("FAIL {label}\n  expected: {}\n  got     : {digest}", entry.sha1);
            }
            Err(err) => {
                failed += 1;
                println!("FAIL {label} -> {err:#}");
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f32();
    println!();
    println!("Summary:");
    println!("- Passed: {passed}");
    println!("- Failed: {failed}");
    println!("- Runtime: {:.2}s", elapsed);

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
