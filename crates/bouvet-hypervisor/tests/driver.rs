//! Driver behavior against mock collaborators.
//!
//! The Firecracker API, process launcher and store are replaced by in-memory
//! doubles that record every call, so boot ordering, queueing and the timing
//! rules of the supervisor can be checked without KVM.

use async_trait::async_trait;
use bouvet_hypervisor::{
    ApiConnector, BlockDrive, BootSource, BootStep, ControlApi, Device, Drive, Errno, Firecracker,
    HypervisorConfig, HypervisorError, InstanceActionInfo, InstanceInfo, InstanceState,
    MachineConfiguration, NetworkInterface, Param, PartialDrive, ProcessLauncher, SandboxStore,
    Signal, StoreItem, Supervisor, TapEndpoint, VmmState, Vsock, VsockDevice,
};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Mocks
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Describe,
    MachineConfig(MachineConfiguration),
    BootSource(BootSource),
    PutDrive(Drive),
    PatchDrive(PartialDrive),
    NetworkInterface(NetworkInterface),
    Vsock(Vsock),
    Action(InstanceActionInfo),
}

#[derive(Default)]
struct MockApi {
    calls: Mutex<Vec<Call>>,
    /// `None` makes describe fail as if nothing listened on the socket
    state: Mutex<Option<InstanceState>>,
    /// Name of an operation that fails
    fail_on: Mutex<Option<&'static str>>,
}

impl MockApi {
    fn answering(state: InstanceState) -> Arc<Self> {
        let api = Arc::new(Self::default());
        api.set_state(Some(state));
        api
    }

    fn set_state(&self, state: Option<InstanceState>) {
        *self.state.lock().unwrap() = state;
    }

    fn fail_on(&self, op: &'static str) {
        *self.fail_on.lock().unwrap() = Some(op);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls other than the describe polls.
    fn commands(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| *c != Call::Describe)
            .collect()
    }

    fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, op: &'static str, call: Call) -> bouvet_hypervisor::Result<()> {
        self.calls.lock().unwrap().push(call);
        if *self.fail_on.lock().unwrap() == Some(op) {
            return Err(HypervisorError::Api {
                request: op.to_string(),
                status: 400,
                body: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ControlApi for MockApi {
    async fn describe_instance(&self) -> bouvet_hypervisor::Result<InstanceInfo> {
        self.calls.lock().unwrap().push(Call::Describe);
        match self.state.lock().unwrap().clone() {
            Some(state) => Ok(InstanceInfo { id: None, state }),
            None => Err(HypervisorError::Transport("connection refused".into())),
        }
    }

    async fn put_machine_config(&self, config: &MachineConfiguration) -> bouvet_hypervisor::Result<()> {
        self.record("machine_config", Call::MachineConfig(config.clone()))
    }

    async fn put_boot_source(&self, source: &BootSource) -> bouvet_hypervisor::Result<()> {
        self.record("boot_source", Call::BootSource(source.clone()))
    }

    async fn put_drive(&self, drive: &Drive) -> bouvet_hypervisor::Result<()> {
        self.record("put_drive", Call::PutDrive(drive.clone()))
    }

    async fn patch_drive(&self, drive: &PartialDrive) -> bouvet_hypervisor::Result<()> {
        self.record("patch_drive", Call::PatchDrive(drive.clone()))
    }

    async fn put_network_interface(&self, iface: &NetworkInterface) -> bouvet_hypervisor::Result<()> {
        self.record("network_interface", Call::NetworkInterface(iface.clone()))
    }

    async fn put_vsock(&self, vsock: &Vsock) -> bouvet_hypervisor::Result<()> {
        self.record("vsock", Call::Vsock(vsock.clone()))
    }

    async fn create_action(&self, action: &InstanceActionInfo) -> bouvet_hypervisor::Result<()> {
        self.record("action", Call::Action(action.clone()))
    }
}

struct MockConnector {
    api: Arc<MockApi>,
    connects: AtomicUsize,
}

impl ApiConnector for MockConnector {
    fn connect(&self, _socket_path: &Path) -> Arc<dyn ControlApi> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.api.clone()
    }
}

const MOCK_PID: u32 = 4242;

struct MockLauncher {
    alive: AtomicBool,
    /// Whether SIGTERM ends the process
    dies_on_term: bool,
    /// Signal that fails with the given errno instead of being delivered
    fail_signal: Option<(Signal, Errno)>,
    signals: Mutex<Vec<Option<Signal>>>,
    launches: Mutex<Vec<(PathBuf, PathBuf)>>,
}

impl MockLauncher {
    fn new(dies_on_term: bool) -> Arc<Self> {
        Arc::new(Self::with_failing_signal(dies_on_term, None))
    }

    fn with_failing_signal(dies_on_term: bool, fail_signal: Option<(Signal, Errno)>) -> Self {
        Self {
            alive: AtomicBool::new(false),
            dies_on_term,
            fail_signal,
            signals: Mutex::new(Vec::new()),
            launches: Mutex::new(Vec::new()),
        }
    }

    fn running(dies_on_term: bool) -> Arc<Self> {
        let launcher = Self::new(dies_on_term);
        launcher.alive.store(true, Ordering::SeqCst);
        launcher
    }

    fn failing(signal: Signal, errno: Errno) -> Arc<Self> {
        Arc::new(Self::with_failing_signal(true, Some((signal, errno))))
    }

    fn signals(&self) -> Vec<Option<Signal>> {
        self.signals.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for MockLauncher {
    async fn launch(&self, executable: &Path, socket_path: &Path) -> bouvet_hypervisor::Result<u32> {
        self.launches
            .lock()
            .unwrap()
            .push((executable.to_path_buf(), socket_path.to_path_buf()));
        self.alive.store(true, Ordering::SeqCst);
        Ok(MOCK_PID)
    }

    async fn signal(&self, pid: u32, signal: Option<Signal>) -> Result<(), Errno> {
        assert_eq!(pid, MOCK_PID);
        self.signals.lock().unwrap().push(signal);
        if let (Some(sent), Some((failing, errno))) = (signal, self.fail_signal) {
            if sent == failing {
                return Err(errno);
            }
        }
        let alive = self.alive.load(Ordering::SeqCst);
        match signal {
            None if alive => Ok(()),
            None => Err(Errno::ESRCH),
            Some(Signal::SIGTERM) => {
                if self.dies_on_term {
                    self.alive.store(false, Ordering::SeqCst);
                }
                Ok(())
            }
            Some(_) if alive => {
                self.alive.store(false, Ordering::SeqCst);
                Ok(())
            }
            Some(_) => Err(Errno::ESRCH),
        }
    }
}

#[derive(Default)]
struct MemoryStore {
    items: Mutex<HashMap<StoreItem, Vec<u8>>>,
    scratch: AtomicUsize,
}

impl SandboxStore for MemoryStore {
    fn load(&self, item: StoreItem) -> bouvet_hypervisor::Result<Vec<u8>> {
        self.items
            .lock()
            .unwrap()
            .get(&item)
            .cloned()
            .ok_or_else(|| HypervisorError::Persistence(format!("{item} not found")))
    }

    fn store(&self, item: StoreItem, data: &[u8]) -> bouvet_hypervisor::Result<()> {
        self.items.lock().unwrap().insert(item, data.to_vec());
        Ok(())
    }

    fn scratch_file(&self) -> bouvet_hypervisor::Result<PathBuf> {
        let n = self.scratch.fetch_add(1, Ordering::SeqCst);
        Ok(PathBuf::from(format!("/scratch/{n}")))
    }
}

struct Harness {
    fc: Firecracker,
    api: Arc<MockApi>,
    connector: Arc<MockConnector>,
    launcher: Arc<MockLauncher>,
    store: Arc<MemoryStore>,
    _run_dir: tempfile::TempDir,
}

fn harness_with(config: HypervisorConfig, store: Arc<MemoryStore>) -> Harness {
    harness_with_launcher(config, store, MockLauncher::new(true))
}

fn harness_with_launcher(
    config: HypervisorConfig,
    store: Arc<MemoryStore>,
    launcher: Arc<MockLauncher>,
) -> Harness {
    let run_dir = tempfile::tempdir().unwrap();
    let config = HypervisorConfig {
        run_dir: run_dir.path().to_path_buf(),
        ..config
    };

    let api = MockApi::answering(InstanceState::Running);
    let connector = Arc::new(MockConnector {
        api: api.clone(),
        connects: AtomicUsize::new(0),
    });
    let fc = Firecracker::builder("sb-1", config, store.clone())
        .connector(connector.clone())
        .launcher(launcher.clone())
        .create();

    Harness {
        fc,
        api,
        connector,
        launcher,
        store,
        _run_dir: run_dir,
    }
}

fn harness() -> Harness {
    harness_with(test_config(), Arc::new(MemoryStore::default()))
}

fn test_config() -> HypervisorConfig {
    HypervisorConfig {
        kernel_path: PathBuf::from("/images/vmlinux"),
        image_path: Some(PathBuf::from("/images/rootfs.ext4")),
        kernel_params: vec![Param::new("root", "/dev/vda1")],
        memory_mib: 512,
        vcpu_count: 2,
        ..Default::default()
    }
}

fn block(id: &str, file: &str, index: usize) -> Device {
    Device::Block(BlockDrive {
        id: id.into(),
        file: file.into(),
        index,
    })
}

fn tap(name: &str) -> Device {
    Device::Network(Arc::new(TapEndpoint {
        name: name.into(),
        hardware_addr: "02:fc:00:00:00:05".into(),
        tap_name: format!("tap_{name}"),
    }))
}

/// An fd on a uniquely named file. Whether it is still open is checked by
/// its `/proc/self/fd` target, so a number reused by another test thread is
/// not mistaken for it.
struct TrackedFd {
    raw: RawFd,
    target: PathBuf,
    _dir: tempfile::TempDir,
}

impl TrackedFd {
    fn is_open(&self) -> bool {
        std::fs::read_link(format!("/proc/self/fd/{}", self.raw))
            .map(|target| target == self.target)
            .unwrap_or(false)
    }
}

fn tracked_fd() -> (OwnedFd, TrackedFd) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vhost-vsock");
    let file = std::fs::File::create(&path).unwrap();
    let fd: OwnedFd = file.into();
    let tracked = TrackedFd {
        raw: fd.as_raw_fd(),
        target: path.canonicalize().unwrap(),
        _dir: dir,
    };
    assert!(tracked.is_open());
    (fd, tracked)
}

fn put_drive_ids(calls: &[Call]) -> Vec<String> {
    calls
        .iter()
        .filter_map(|c| match c {
            Call::PutDrive(d) => Some(d.drive_id.clone()),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Boot sequence
// ============================================================================

#[tokio::test]
async fn test_boot_sequence_order() {
    let h = harness();
    h.fc.start_sandbox(5).await.unwrap();

    let commands = h.api.commands();
    assert_eq!(
        commands[0],
        Call::MachineConfig(MachineConfiguration {
            vcpu_count: 2,
            mem_size_mib: 512,
            ht_enabled: false,
        })
    );
    assert!(matches!(commands[1], Call::BootSource(_)));
    assert_eq!(
        commands[2],
        Call::PutDrive(Drive {
            drive_id: "rootfs".into(),
            path_on_host: PathBuf::from("/images/rootfs.ext4"),
            is_root_device: false,
            is_read_only: true,
        })
    );
    assert_eq!(
        commands.last(),
        Some(&Call::Action(InstanceActionInfo::instance_start()))
    );

    let launches = h.launcher.launches.lock().unwrap().clone();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].1, h.fc.socket_path());

    assert_eq!(h.fc.state().await, VmmState::VmReady);
    assert_eq!(h.fc.pid().await, MOCK_PID);
}

#[tokio::test]
async fn test_fresh_instance_preallocates_eight_drives() {
    let h = harness();
    assert!(h.fc.disk_pool().await.is_empty());

    h.fc.start_sandbox(5).await.unwrap();

    let expected: Vec<String> = (0..8).map(|i| format!("drive_{i}")).collect();
    assert_eq!(h.fc.disk_pool().await, expected);

    let commands = h.api.commands();
    let ids = put_drive_ids(&commands);
    assert_eq!(ids[0], "rootfs");
    assert_eq!(ids[1..], expected[..]);

    let mut paths: Vec<PathBuf> = commands
        .iter()
        .filter_map(|c| match c {
            Call::PutDrive(d) if d.drive_id.starts_with("drive_") => {
                assert!(!d.is_read_only);
                assert!(!d.is_root_device);
                Some(d.path_on_host.clone())
            }
            _ => None,
        })
        .collect();
    paths.dedup();
    assert_eq!(paths.len(), 8);
}

#[tokio::test]
async fn test_boot_cmdline_caller_params_first() {
    let h = harness();
    h.fc.start_sandbox(5).await.unwrap();

    let source = h
        .api
        .commands()
        .into_iter()
        .find_map(|c| match c {
            Call::BootSource(s) => Some(s),
            _ => None,
        })
        .unwrap();

    assert_eq!(source.kernel_image_path, PathBuf::from("/images/vmlinux"));
    assert_eq!(
        source.boot_args,
        "root=/dev/vda1 root=/dev/vda1 rootflags=data=ordered,errors=remount-ro ro \
         rootfstype=ext4 pci=off reboot=k panic=1 iommu=off 8250.nr_uarts=0 net.ifnames=0 \
         random.trust_cpu=on acpi=off"
    );
}

#[tokio::test]
async fn test_boot_prefers_initrd() {
    let config = HypervisorConfig {
        initrd_path: Some(PathBuf::from("/images/initrd.img")),
        ..test_config()
    };
    let h = harness_with(config, Arc::new(MemoryStore::default()));
    h.fc.start_sandbox(5).await.unwrap();

    let commands = h.api.commands();
    let rootfs = commands
        .iter()
        .find_map(|c| match c {
            Call::PutDrive(d) if d.drive_id == "rootfs" => Some(d.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(rootfs.path_on_host, PathBuf::from("/images/initrd.img"));
}

#[tokio::test]
async fn test_pid_persisted_and_reloaded() {
    let h = harness();
    h.fc.start_sandbox(5).await.unwrap();

    let saved = h.store.load(StoreItem::Hypervisor).unwrap();
    assert_eq!(saved, br#"{"pid":4242}"#);

    // A new instance over the same store recovers the PID
    let recovered = harness_with(test_config(), h.store.clone());
    assert_eq!(recovered.fc.pid().await, MOCK_PID);
}

#[tokio::test]
async fn test_pid_persisted_before_api_wait() {
    let h = harness();
    h.api.set_state(None);

    let started = {
        let fc = &h.fc;
        tokio::time::timeout(Duration::from_millis(200), fc.start_sandbox(5)).await
    };
    assert!(started.is_err(), "boot should still be waiting for the API");
    assert!(h.store.load(StoreItem::Hypervisor).is_ok());
}

#[tokio::test]
async fn test_control_channel_rebuilt_before_start() {
    let h = harness();
    h.fc.start_sandbox(5).await.unwrap();
    // Lazily built once, then rebuilt for InstanceStart
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_boot_failure_names_step_and_kills_vmm() {
    let h = harness();
    h.api.fail_on("boot_source");

    let err = h.fc.start_sandbox(5).await.unwrap_err();
    assert_eq!(err.boot_step(), Some(BootStep::BootSource));
    match &err {
        HypervisorError::Boot { cleanup, .. } => assert!(cleanup.is_none()),
        other => panic!("unexpected error: {other:?}"),
    }

    // No rollback: the drive/pool steps never ran, nothing after them either
    assert!(put_drive_ids(&h.api.commands()).is_empty());
    assert!(h.launcher.signals().contains(&Some(Signal::SIGTERM)));
    assert_eq!(h.fc.state().await, VmmState::NotReady);
}

#[tokio::test]
async fn test_boot_failure_kills_vmm_reusing_recorded_pid() {
    // Left over from an earlier run; the new VMM happens to get the same PID
    let store = Arc::new(MemoryStore::default());
    store
        .store(StoreItem::Hypervisor, br#"{"pid":4242}"#)
        .unwrap();
    let h = harness_with(test_config(), store);
    assert_eq!(h.fc.pid().await, MOCK_PID);
    h.api.fail_on("boot_source");

    let err = h.fc.start_sandbox(5).await.unwrap_err();
    assert_eq!(err.boot_step(), Some(BootStep::BootSource));
    assert_eq!(h.launcher.launches.lock().unwrap().len(), 1);
    assert!(h.launcher.signals().contains(&Some(Signal::SIGTERM)));
    assert!(!h.launcher.alive.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_failed_cleanup_attached_to_boot_error() {
    let h = harness_with_launcher(
        test_config(),
        Arc::new(MemoryStore::default()),
        MockLauncher::failing(Signal::SIGKILL, Errno::EPERM),
    );
    h.api.fail_on("boot_source");

    let err = h.fc.start_sandbox(5).await.unwrap_err();
    assert_eq!(err.boot_step(), Some(BootStep::BootSource));
    match &err {
        HypervisorError::Boot {
            source, cleanup, ..
        } => {
            assert!(matches!(**source, HypervisorError::Api { .. }));
            assert!(matches!(
                cleanup.as_deref(),
                Some(HypervisorError::Signal(Errno::EPERM))
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.fc.state().await, VmmState::NotReady);
}

#[tokio::test]
async fn test_missing_kernel_fails_kernel_step() {
    let config = HypervisorConfig {
        kernel_path: PathBuf::new(),
        ..test_config()
    };
    let h = harness_with(config, Arc::new(MemoryStore::default()));

    let err = h.fc.start_sandbox(5).await.unwrap_err();
    assert_eq!(err.boot_step(), Some(BootStep::Kernel));
    assert!(h.launcher.signals().contains(&Some(Signal::SIGKILL)));
}

#[tokio::test(start_paused = true)]
async fn test_guest_never_running_times_out() {
    let h = harness();
    h.api.set_state(Some(InstanceState::Starting));

    let err = h.fc.start_sandbox(1).await.unwrap_err();
    assert_eq!(err.boot_step(), Some(BootStep::WaitRunning));
    assert!(err.is_timeout());
    assert!(h.launcher.signals().contains(&Some(Signal::SIGTERM)));
}

// ============================================================================
// Device orchestration
// ============================================================================

#[tokio::test]
async fn test_add_device_while_not_ready_is_queued() {
    let h = harness();
    h.fc.add_device(block("data", "/images/data.ext4", 0)).await.unwrap();
    h.fc.add_device(tap("eth0")).await.unwrap();

    assert!(h.api.calls().is_empty());
    assert_eq!(h.connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_queued_devices_flushed_in_order() {
    let h = harness();
    h.fc.add_device(block("data", "/images/data.ext4", 0)).await.unwrap();
    h.fc.add_device(tap("eth0")).await.unwrap();
    h.fc.add_device(block("logs", "/images/logs.ext4", 1)).await.unwrap();

    h.fc.start_sandbox(5).await.unwrap();

    let commands = h.api.commands();
    let pool_end = commands
        .iter()
        .position(|c| matches!(c, Call::PutDrive(d) if d.drive_id == "drive_7"))
        .unwrap();
    let flushed = &commands[pool_end + 1..commands.len() - 1];

    assert_eq!(flushed.len(), 3);
    assert!(matches!(&flushed[0], Call::PutDrive(d) if d.drive_id == "data" && !d.is_read_only));
    assert_eq!(
        flushed[1],
        Call::NetworkInterface(NetworkInterface {
            iface_id: "eth0".into(),
            host_dev_name: "tap_eth0".into(),
            guest_mac: Some("02:fc:00:00:00:05".into()),
            allow_mmds_requests: false,
        })
    );
    assert!(matches!(&flushed[2], Call::PutDrive(d) if d.drive_id == "logs"));
}

#[tokio::test]
async fn test_add_device_after_boot_dispatches_immediately() {
    let h = harness();
    h.fc.start_sandbox(5).await.unwrap();
    h.api.clear();

    h.fc.add_device(tap("eth1")).await.unwrap();
    assert!(matches!(
        h.api.commands().as_slice(),
        [Call::NetworkInterface(iface)] if iface.iface_id == "eth1"
    ));
}

#[tokio::test]
async fn test_vsock_device() {
    let h = harness();
    h.fc.start_sandbox(5).await.unwrap();
    h.api.clear();

    let (vhost_fd, tracked) = tracked_fd();
    h.fc.add_device(Device::Vsock(VsockDevice {
        context_id: 3,
        vhost_fd,
    }))
    .await
    .unwrap();

    assert_eq!(
        h.api.commands(),
        vec![Call::Vsock(Vsock {
            vsock_id: "root".into(),
            guest_cid: 3,
        })]
    );
    assert!(!tracked.is_open());
}

#[tokio::test]
async fn test_queued_vsock_fd_closed_after_flush() {
    let h = harness();
    let (vhost_fd, tracked) = tracked_fd();
    h.fc.add_device(Device::Vsock(VsockDevice {
        context_id: 7,
        vhost_fd,
    }))
    .await
    .unwrap();
    assert!(tracked.is_open());

    h.fc.start_sandbox(5).await.unwrap();
    assert!(!tracked.is_open());
}

#[tokio::test]
async fn test_vsock_failure_is_returned() {
    let h = harness();
    h.fc.start_sandbox(5).await.unwrap();
    h.api.fail_on("vsock");

    let (vhost_fd, tracked) = tracked_fd();
    let err = h
        .fc
        .add_device(Device::Vsock(VsockDevice {
            context_id: 3,
            vhost_fd,
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, HypervisorError::Api { .. }));
    assert!(!tracked.is_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_add_device_racing_boot_is_dispatched_once() {
    for _ in 0..20 {
        let h = Arc::new(harness());

        let adder = {
            let h = h.clone();
            tokio::spawn(async move { h.fc.add_device(tap("eth0")).await })
        };
        h.fc.start_sandbox(5).await.unwrap();
        adder.await.unwrap().unwrap();

        let dispatched = h
            .api
            .commands()
            .iter()
            .filter(|c| matches!(c, Call::NetworkInterface(iface) if iface.iface_id == "eth0"))
            .count();
        assert_eq!(dispatched, 1);
    }
}

#[tokio::test]
async fn test_disconnect_queues_again() {
    let h = harness();
    h.fc.start_sandbox(5).await.unwrap();
    h.fc.disconnect().await;
    assert_eq!(h.fc.state().await, VmmState::NotReady);
    h.api.clear();

    h.fc.add_device(tap("eth2")).await.unwrap();
    assert!(h.api.calls().is_empty());
}

// ============================================================================
// Hotplug
// ============================================================================

#[tokio::test]
async fn test_hotplug_rescans_only_when_running() {
    let h = harness();
    h.fc.start_sandbox(5).await.unwrap();
    h.api.clear();

    h.fc.hotplug_add_device(block("vol", "/dev/dm-3", 3)).await.unwrap();
    assert_eq!(
        h.api.commands(),
        vec![
            Call::PatchDrive(PartialDrive {
                drive_id: "drive_3".into(),
                path_on_host: PathBuf::from("/dev/dm-3"),
            }),
            Call::Action(InstanceActionInfo::block_device_rescan("drive_3")),
        ]
    );

    for state in [
        Some(InstanceState::Starting),
        Some(InstanceState::Halted),
        None,
    ] {
        h.api.set_state(state);
        h.api.clear();
        h.fc.hotplug_add_device(block("vol", "/dev/dm-4", 3)).await.unwrap();
        assert_eq!(
            h.api.commands(),
            vec![Call::PatchDrive(PartialDrive {
                drive_id: "drive_3".into(),
                path_on_host: PathBuf::from("/dev/dm-4"),
            })]
        );
    }
}

#[tokio::test]
async fn test_hotplug_rejects_non_block_devices() {
    let h = harness();
    h.fc.start_sandbox(5).await.unwrap();
    h.api.clear();

    let err = h.fc.hotplug_add_device(tap("eth3")).await.unwrap_err();
    assert!(matches!(err, HypervisorError::UnsupportedDevice(_)));
    assert!(h.api.calls().is_empty());
}

#[tokio::test]
async fn test_hotplug_index_outside_pool() {
    let h = harness();
    h.fc.start_sandbox(5).await.unwrap();
    h.api.clear();

    let err = h
        .fc
        .hotplug_add_device(block("vol", "/dev/dm-8", 8))
        .await
        .unwrap_err();
    assert!(matches!(err, HypervisorError::UnsupportedDevice(_)));
    assert!(h.api.calls().is_empty());
}

#[tokio::test]
async fn test_hotplug_before_pool_exists() {
    let h = harness();
    let err = h
        .fc
        .hotplug_add_device(block("vol", "/dev/dm-0", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, HypervisorError::UnsupportedDevice(_)));
    assert!(h.api.calls().is_empty());
}

#[tokio::test]
async fn test_hotplug_remove_is_noop() {
    let h = harness();
    h.fc.start_sandbox(5).await.unwrap();
    h.api.clear();

    h.fc.hotplug_remove_device(block("vol", "/dev/dm-3", 3)).await.unwrap();
    assert!(h.api.calls().is_empty());
}

// ============================================================================
// Supervisor
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_wait_ready_times_out_within_one_poll() {
    let api = Arc::new(MockApi::default());
    let supervisor = Supervisor::new(MockLauncher::new(true));

    let start = Instant::now();
    let err = supervisor.wait_ready(api.as_ref(), 5).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_secs(5), "elapsed {elapsed:?}");
    assert!(
        elapsed <= Duration::from_secs(5) + Duration::from_millis(10),
        "elapsed {elapsed:?}"
    );
    match err {
        HypervisorError::Timeout { last_error, .. } => {
            assert!(matches!(*last_error, HypervisorError::Transport(_)))
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

/// Accepts the connection but never answers.
struct SilentApi;

#[async_trait]
impl ControlApi for SilentApi {
    async fn describe_instance(&self) -> bouvet_hypervisor::Result<InstanceInfo> {
        std::future::pending().await
    }

    async fn put_machine_config(&self, _: &MachineConfiguration) -> bouvet_hypervisor::Result<()> {
        unreachable!()
    }

    async fn put_boot_source(&self, _: &BootSource) -> bouvet_hypervisor::Result<()> {
        unreachable!()
    }

    async fn put_drive(&self, _: &Drive) -> bouvet_hypervisor::Result<()> {
        unreachable!()
    }

    async fn patch_drive(&self, _: &PartialDrive) -> bouvet_hypervisor::Result<()> {
        unreachable!()
    }

    async fn put_network_interface(&self, _: &NetworkInterface) -> bouvet_hypervisor::Result<()> {
        unreachable!()
    }

    async fn put_vsock(&self, _: &Vsock) -> bouvet_hypervisor::Result<()> {
        unreachable!()
    }

    async fn create_action(&self, _: &InstanceActionInfo) -> bouvet_hypervisor::Result<()> {
        unreachable!()
    }
}

#[tokio::test(start_paused = true)]
async fn test_waits_bounded_against_silent_api() {
    let supervisor = Supervisor::new(MockLauncher::new(true));

    for running in [false, true] {
        let start = Instant::now();
        let wait = async {
            if running {
                supervisor.wait_running(&SilentApi, 5).await
            } else {
                supervisor.wait_ready(&SilentApi, 5).await
            }
        };
        let err = tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .expect("wait did not honour its timeout")
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(5), "elapsed {elapsed:?}");
        assert!(
            elapsed <= Duration::from_secs(5) + Duration::from_millis(10),
            "elapsed {elapsed:?}"
        );
        match err {
            HypervisorError::Timeout { last_error, .. } => {
                assert!(matches!(*last_error, HypervisorError::Transport(_)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_wait_ready_negative_timeout() {
    let api = MockApi::answering(InstanceState::Running);
    let supervisor = Supervisor::new(MockLauncher::new(true));

    let err = supervisor.wait_ready(api.as_ref(), -1).await.unwrap_err();
    assert!(matches!(err, HypervisorError::Config(_)));
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn test_wait_ready_accepts_any_state() {
    let api = MockApi::answering(InstanceState::Uninitialized);
    let supervisor = Supervisor::new(MockLauncher::new(true));
    supervisor.wait_ready(api.as_ref(), 0).await.unwrap();
    assert_eq!(api.calls(), vec![Call::Describe]);
}

#[tokio::test]
async fn test_terminate_dead_process_sends_nothing() {
    let launcher = MockLauncher::new(true);
    let supervisor = Supervisor::new(launcher.clone());

    supervisor
        .terminate(MOCK_PID, Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(launcher.signals(), vec![None]);
}

#[tokio::test]
async fn test_terminate_graceful_exit() {
    let launcher = MockLauncher::running(true);
    let supervisor = Supervisor::new(launcher.clone());

    supervisor
        .terminate(MOCK_PID, Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(
        launcher.signals(),
        vec![None, Some(Signal::SIGTERM), None, Some(Signal::SIGKILL)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_terminate_kills_after_grace_period() {
    let launcher = MockLauncher::running(false);
    let supervisor = Supervisor::new(launcher.clone());

    let start = Instant::now();
    supervisor
        .terminate(MOCK_PID, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_secs(1));

    let signals = launcher.signals();
    assert_eq!(signals[1], Some(Signal::SIGTERM));
    assert_eq!(signals.last(), Some(&Some(Signal::SIGKILL)));
    assert!(!launcher.alive.load(Ordering::SeqCst));

    // A second call finds nothing to do
    let before = launcher.signals().len();
    supervisor
        .terminate(MOCK_PID, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(launcher.signals().len(), before + 1);
}

#[tokio::test]
async fn test_terminate_process_gone_before_sigterm() {
    let launcher = MockLauncher::failing(Signal::SIGTERM, Errno::ESRCH);
    launcher.alive.store(true, Ordering::SeqCst);
    let supervisor = Supervisor::new(launcher.clone());

    supervisor
        .terminate(MOCK_PID, Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(launcher.signals(), vec![None, Some(Signal::SIGTERM)]);
}

#[tokio::test]
async fn test_stop_sandbox_without_vmm() {
    let h = harness();
    h.fc.stop_sandbox().await.unwrap();
    assert!(h.launcher.signals().is_empty());
}

// ============================================================================
// Readiness across a run
// ============================================================================

#[tokio::test]
async fn test_readiness_is_monotonic_over_a_run() {
    let h = harness();
    let mut seen = vec![h.fc.state().await];

    h.fc.start_sandbox(5).await.unwrap();
    seen.push(h.fc.state().await);
    h.fc.hotplug_add_device(block("vol", "/dev/dm-1", 1)).await.unwrap();
    seen.push(h.fc.state().await);

    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last(), Some(&VmmState::VmReady));

    h.fc.stop_sandbox().await.unwrap();
    h.fc.disconnect().await;
    assert_eq!(h.fc.state().await, VmmState::NotReady);
}

#[tokio::test]
async fn test_capabilities() {
    let h = harness();
    let caps = h.fc.capabilities();
    assert!(caps.block_device_hotplug);
    assert!(!caps.fs_sharing);
    assert!(h.fc.console_path().is_none());
}

#[tokio::test]
async fn test_resize_reports_unchanged() {
    let h = harness();
    assert_eq!(h.fc.resize_memory(1024).await.unwrap(), 0);
    assert_eq!(h.fc.resize_vcpus(4).await.unwrap(), (2, 2));
    assert!(h.api.calls().is_empty());
}
