use std::{
    env,
    ffi::OsString,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
};

use anyhow::{anyhow, Context as _, Result};
use aya_build::{Package, Toolchain};
use cargo_metadata::{Artifact, CompilerMessage, Message, Target};

const EBPF_PACKAGE: &str = "l4-redirect-ebpf";
const EBPF_BINARY: &str = "l4-redirect";
const LOG_PREFIX: &str = "[l4-redirect-ebpf]";

fn main() -> Result<()> {
    let out_dir = PathBuf::from(env::var_os("OUT_DIR").ok_or(anyhow!("OUT_DIR not set"))?);
    println!("cargo:rerun-if-env-changed=PATH");

    if which::which("bpf-linker").is_err() {
        // Host-only builds (unit tests, simulate) do not need the object;
        // `attach` refuses to run with an empty one.
        println!("cargo:warning=bpf-linker not found on PATH, building without the eBPF object");
        let dst = out_dir.join(EBPF_BINARY);
        fs::write(&dst, b"").with_context(|| format!("failed to write {dst:?}"))?;
        return Ok(());
    }

    let metadata = cargo_metadata::MetadataCommand::new()
        .no_deps()
        .exec()
        .context("MetadataCommand::exec")?;
    let ebpf_package = metadata
        .packages
        .iter()
        .find(|package| package.name.as_str() == EBPF_PACKAGE)
        .ok_or_else(|| anyhow!("{EBPF_PACKAGE} package not found"))?;
    let root_dir = ebpf_package
        .manifest_path
        .parent()
        .ok_or_else(|| anyhow!("no parent for {}", ebpf_package.manifest_path))?;

    let package = Package {
        name: EBPF_PACKAGE,
        root_dir: root_dir.as_str(),
        ..Default::default()
    };
    build_ebpf(&out_dir, package, Toolchain::default())
}

/// Builds the eBPF crate for the BPF target matching the host endianness and
/// copies its binaries into `out_dir`. Compiler output is relayed with a
/// prefix so it stands out in the host build log.
fn build_ebpf(out_dir: &Path, package: Package<'_>, toolchain: Toolchain<'_>) -> Result<()> {
    let Package {
        name,
        root_dir,
        no_default_features,
        features,
    } = package;
    println!("cargo:rerun-if-changed={root_dir}");

    let mut cmd = ebpf_command(name, toolchain)?;
    if no_default_features {
        cmd.arg("--no-default-features");
    }
    if !features.is_empty() {
        cmd.args(["--features", &features.join(",")]);
    }
    cmd.arg("--target-dir").arg(out_dir.join(name));

    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {cmd:?}"))?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("child stderr not captured"))?;
    let relay = thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(|line| line.ok()) {
            eprintln!("{LOG_PREFIX} {line}");
        }
    });

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout not captured"))?;
    let mut binaries = Vec::new();
    for message in Message::parse_stream(BufReader::new(stdout)) {
        match message.context("invalid cargo message")? {
            Message::CompilerArtifact(Artifact {
                executable: Some(executable),
                target: Target { name, .. },
                ..
            }) => binaries.push((name, executable.into_std_path_buf())),
            Message::CompilerMessage(CompilerMessage { message, .. }) => {
                for line in message.rendered.iter().flat_map(|r| r.lines()) {
                    eprintln!("{LOG_PREFIX} {line}");
                }
            }
            Message::TextLine(line) => eprintln!("{LOG_PREFIX} {line}"),
            _ => {}
        }
    }

    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {cmd:?}"))?;
    relay
        .join()
        .map_err(|_| anyhow!("stderr relay thread panicked"))?;
    if !status.success() {
        return Err(anyhow!("{cmd:?} failed: {status:?}"));
    }

    for (name, binary) in binaries {
        let dst = out_dir.join(name);
        fs::copy(&binary, &dst).with_context(|| format!("failed to copy {binary:?} to {dst:?}"))?;
    }
    Ok(())
}

fn ebpf_command(package: &str, toolchain: Toolchain<'_>) -> Result<Command> {
    let endian =
        env::var_os("CARGO_CFG_TARGET_ENDIAN").ok_or(anyhow!("CARGO_CFG_TARGET_ENDIAN not set"))?;
    let target = match endian.to_string_lossy().as_ref() {
        "big" => "bpfeb-unknown-none",
        "little" => "bpfel-unknown-none",
        other => return Err(anyhow!("unsupported endian={other}")),
    };
    let arch = env::var("CARGO_CFG_TARGET_ARCH").context("CARGO_CFG_TARGET_ARCH not set")?;
    let arch = if arch.starts_with("riscv64") {
        "riscv64"
    } else {
        arch.as_str()
    };
    let toolchain = match toolchain {
        Toolchain::Nightly => "nightly",
        Toolchain::Custom(name) => name,
    };

    let mut cmd = Command::new("rustup");
    cmd.args([
        "run",
        toolchain,
        "cargo",
        "build",
        "--package",
        package,
        "-Z",
        "build-std=core",
        "--bins",
        "--message-format=json",
        "--release",
        "--target",
        target,
    ]);

    // Separated by 0x1f as CARGO_ENCODED_RUSTFLAGS expects.
    let mut rustflags = OsString::new();
    for (i, flag) in [
        format!("--cfg=bpf_target_arch=\"{arch}\""),
        "-Cdebuginfo=2".to_string(),
        "-Clink-arg=--btf".to_string(),
    ]
    .iter()
    .enumerate()
    {
        if i > 0 {
            rustflags.push("\x1f");
        }
        rustflags.push(flag);
    }
    cmd.env("CARGO_ENCODED_RUSTFLAGS", rustflags);
    for key in ["RUSTC", "RUSTC_WORKSPACE_WRAPPER"] {
        cmd.env_remove(key);
    }
    Ok(cmd)
}
