use std::{
    convert::TryFrom,
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, ensure, Context, Result};
use aya::maps::{HashMap, Map, MapData, MapError};
use aya::pin::PinError;
use aya::programs::tc::{self, SchedClassifier, SchedClassifierLinkId, TcAttachType};
use aya::{include_bytes_aligned, Ebpf, EbpfLoader};
use log::{debug, info, warn};
use tokio::signal;

use crate::{
    controller::Controller,
    routes::RouteStore,
    table::{PolicyControl, PolicyError},
};
use l4_redirect_common::{PolicyKey, PolicyValue, POLICY_MAP, PROGRAM_NAME, STATS_MAP};

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/l4-redirect"));

pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/l4_redirect";

pub fn policy_pin(pin_dir: &Path) -> PathBuf {
    pin_dir.join(POLICY_MAP)
}

pub fn stats_pin(pin_dir: &Path) -> PathBuf {
    pin_dir.join(STATS_MAP)
}

#[derive(Clone, Debug)]
pub struct AttachOptions {
    pub iface: String,
    pub routes: PathBuf,
    pub pin_dir: PathBuf,
    pub policy_capacity: u32,
}

pub async fn attach_program(opts: AttachOptions) -> Result<()> {
    validate_attach_options(&opts)?;
    ensure!(
        !EBPF_BYTES.is_empty(),
        "l4-redirect was built without the eBPF object; install bpf-linker and rebuild"
    );

    let mut loader = EbpfLoader::new();
    #[allow(deprecated)]
    {
        loader.set_max_entries(POLICY_MAP, opts.policy_capacity);
    }
    let mut bpf = loader
        .load(EBPF_BYTES)
        .context("failed to load eBPF object")?;

    pin_map(&mut bpf, POLICY_MAP, &policy_pin(&opts.pin_dir))?;
    pin_map(&mut bpf, STATS_MAP, &stats_pin(&opts.pin_dir))?;

    let store = RouteStore::open(&opts.routes)?;
    let policy = PinnedPolicy::open(&opts.pin_dir, opts.policy_capacity as usize)?;
    let mut controller = Controller::new(store, policy);
    let restored = controller.restore()?;
    info!(
        "restored {restored} routes from {}",
        opts.routes.display()
    );

    let link = attach_tc(&mut bpf, &opts.iface)?;
    info!(
        "attached {PROGRAM_NAME} to {} (tc ingress), press Ctrl+C to detach",
        opts.iface
    );

    signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;

    info!("detaching {PROGRAM_NAME} from {}", opts.iface);
    detach(&mut bpf, link)?;
    remove_pins(&opts.pin_dir);
    Ok(())
}

fn validate_attach_options(opts: &AttachOptions) -> Result<()> {
    ensure!(!opts.iface.is_empty(), "interface name must not be empty");
    ensure!(
        opts.policy_capacity > 0,
        "policy capacity must be greater than zero"
    );
    Ok(())
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let map = bpf
        .map_mut(map_name)
        .with_context(|| format!("map {map_name} not found"))?;
    match map.pin(path) {
        Ok(()) => Ok(()),
        Err(PinError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::AlreadyExists => {
            // A previous agent left its pin behind. Replace it, otherwise
            // route commands would program a map no program reads.
            warn!("replacing stale pin {}", path.display());
            fs::remove_file(path)
                .with_context(|| format!("failed to remove stale pin {}", path.display()))?;
            map.pin(path)
                .map_err(|err| anyhow!("failed to pin map {map_name} at {}: {err}", path.display()))
        }
        Err(err) => Err(anyhow!(
            "failed to pin map {map_name} at {}: {err}",
            path.display()
        )),
    }
}

fn attach_tc(bpf: &mut Ebpf, iface: &str) -> Result<SchedClassifierLinkId> {
    // Fails harmlessly when the qdisc already exists.
    if let Err(err) = tc::qdisc_add_clsact(iface) {
        debug!("clsact qdisc on {iface}: {err}");
    }
    let program: &mut SchedClassifier = bpf
        .program_mut(PROGRAM_NAME)
        .with_context(|| format!("program {PROGRAM_NAME} not found"))?
        .try_into()
        .context("tc program has wrong type")?;
    program.load().context("failed to load tc program")?;
    program
        .attach(iface, TcAttachType::Ingress)
        .with_context(|| format!("failed to attach tc on {iface}"))
}

fn detach(bpf: &mut Ebpf, link: SchedClassifierLinkId) -> Result<()> {
    let program: &mut SchedClassifier = bpf
        .program_mut(PROGRAM_NAME)
        .with_context(|| format!("program {PROGRAM_NAME} not found"))?
        .try_into()
        .context("tc program has wrong type")?;
    program.detach(link).context("failed to detach tc program")
}

/// Unpins both maps so later route commands fall back to the routes file
/// instead of programming a map nothing reads.
fn remove_pins(pin_dir: &Path) {
    for path in [policy_pin(pin_dir), stats_pin(pin_dir)] {
        match fs::remove_file(&path) {
            Ok(()) => debug!("removed pin {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove pin {}: {err}", path.display()),
        }
    }
}

/// Opens a pinned map. The caller wraps it in the [`Map`] variant it
/// expects; the typed conversion then checks key and value sizes.
pub(crate) fn open_pinned(path: &Path) -> Result<MapData> {
    MapData::from_pin(path)
        .map_err(|e| anyhow!("failed to open pinned map {}: {}", path.display(), e))
}

/// The kernel policy map, reached through its pin.
pub struct PinnedPolicy {
    map: HashMap<MapData, PolicyKey, PolicyValue>,
    capacity: usize,
}

impl PinnedPolicy {
    pub fn open(pin_dir: &Path, capacity: usize) -> Result<Self> {
        let path = policy_pin(pin_dir);
        let map = HashMap::try_from(Map::HashMap(open_pinned(&path)?))
            .map_err(|e| anyhow!("policy map has unexpected layout: {}", e))?;
        Ok(Self { map, capacity })
    }
}

impl PolicyControl for PinnedPolicy {
    fn upsert(&mut self, key: PolicyKey, value: PolicyValue) -> Result<(), PolicyError> {
        let capacity = self.capacity;
        self.map.insert(key, value, 0).map_err(|err| {
            if is_errno(&err, libc::E2BIG) {
                PolicyError::Full { capacity }
            } else {
                PolicyError::Map(err)
            }
        })
    }

    fn remove(&mut self, key: &PolicyKey) -> Result<(), PolicyError> {
        match self.map.remove(key) {
            Err(err) if !matches!(err, MapError::KeyNotFound) && !is_errno(&err, libc::ENOENT) => {
                Err(err.into())
            }
            _ => Ok(()),
        }
    }

    fn entries(&self) -> Result<Vec<(PolicyKey, PolicyValue)>, PolicyError> {
        let mut entries = Vec::new();
        for item in self.map.iter() {
            entries.push(item?);
        }
        Ok(entries)
    }
}

fn is_errno(err: &MapError, code: i32) -> bool {
    matches!(err, MapError::SyscallError(e) if e.io_error.raw_os_error() == Some(code))
}
