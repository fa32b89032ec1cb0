//! Plugin service
//!
//! One [`Plugin`] per process, created by [`Plugin::init`] and reached from
//! the host's notification callbacks through [`Plugin::global`].

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::controller::{Configurator, ControllerRegistry};
use crate::disasm::IcedDisassembler;
use crate::error::{Error, Result};
use crate::kext::{BUNDLE_ID, DriverAdmin, Kext, symbols};
use crate::memory::ReadMemory;
use crate::nvme::{NvmeDriver, QuirkEntry, builtin_quirks};
use crate::offset::{InstructionScan, OffsetStrategy, builtin_patterns};
use crate::patch::{KernelPatcher, find_vtable_slot};
use crate::platform::{Platform, ServiceId};

static PLUGIN: OnceLock<Plugin> = OnceLock::new();

pub struct Plugin {
    config: Config,
    platform: Arc<dyn Platform>,
    kext: Arc<Kext>,
    driver: Arc<dyn NvmeDriver>,
    registry: Arc<ControllerRegistry>,
    quirks: Vec<QuirkEntry>,
    solved: AtomicBool,
    /// Serializes sweeps coming from different notification threads
    sweep_lock: Mutex<()>,
}

impl Plugin {
    /// Plugin talking to the driver through its own request objects.
    pub fn new(config: Config, platform: Arc<dyn Platform>) -> Self {
        let kext = Arc::new(Kext::new());
        let driver: Arc<dyn NvmeDriver> = Arc::new(DriverAdmin::new(kext.clone()));
        Self::with_driver(config, platform, kext, driver)
    }

    pub fn with_driver(
        config: Config,
        platform: Arc<dyn Platform>,
        kext: Arc<Kext>,
        driver: Arc<dyn NvmeDriver>,
    ) -> Self {
        let mut quirks = builtin_quirks();
        quirks.extend(config.extra_quirks.iter().cloned());
        let registry = Arc::new(ControllerRegistry::new(config.default_ps_max_latency_us));
        Self {
            config,
            platform,
            kext,
            driver,
            registry,
            quirks,
            solved: AtomicBool::new(false),
            sweep_lock: Mutex::new(()),
        }
    }

    /// Create the process-wide instance. Later calls return the first one.
    pub fn init(config: Config, platform: Arc<dyn Platform>) -> &'static Plugin {
        let mut created = false;
        let plugin = PLUGIN.get_or_init(|| {
            created = true;
            Plugin::new(config, platform)
        });
        if created {
            info!(
                "NVMeFix starting (enabled: {}, debug: {})",
                plugin.config.enabled, plugin.config.debug
            );
        } else {
            warn!("NVMeFix already initialized");
        }
        plugin
    }

    pub fn global() -> Option<&'static Plugin> {
        PLUGIN.get()
    }

    /// Release every controller. Installed patches stay in place.
    pub fn deinit(&self) {
        let count = self.registry.len();
        self.registry.clear();
        info!("NVMeFix stopped, released {} controllers", count);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ControllerRegistry> {
        &self.registry
    }

    pub fn kext(&self) -> &Arc<Kext> {
        &self.kext
    }

    pub fn is_solved(&self) -> bool {
        self.solved.load(Ordering::Acquire)
    }

    /// The driver image was loaded: resolve symbols, discover member offsets
    /// from its code and process any controller matched so far.
    pub fn on_image_loaded<R: ReadMemory>(
        &self,
        patcher: &dyn KernelPatcher,
        image: R,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        info!(
            "{} loaded at {:#x} ({} bytes)",
            BUNDLE_ID,
            image.base_address(),
            image.size()
        );
        let patterns = self.config.patterns.clone().unwrap_or_else(builtin_patterns);
        let scan = InstructionScan::new(image, IcedDisassembler, patterns)
            .with_max_instructions(self.config.max_scan_instructions);
        self.solve_with(patcher, &scan)
    }

    /// Resolve the image with a given offset strategy.
    pub fn solve_with(&self, patcher: &dyn KernelPatcher, strategy: &dyn OffsetStrategy) -> Result<()> {
        if let Err(e) = self.kext.solve(patcher, strategy) {
            warn!("Failed to resolve driver image: {}", e);
            return Err(e);
        }
        self.solved.store(true, Ordering::Release);
        info!("Resolved driver symbols and members ({})", strategy.name());

        self.install_activity_hook(patcher);
        self.sweep();
        Ok(())
    }

    fn install_activity_hook(&self, patcher: &dyn KernelPatcher) {
        if self.kext.functions.activity_tickle.is_routed() {
            return;
        }
        match self.route_activity_tickle(patcher) {
            Ok(slot) => info!("Intercepted activityTickle at vtable slot {:#x}", slot),
            Err(e) => warn!("{}, idle tracking disabled", e),
        }
    }

    /// Route the controller's `activityTickle` vtable slot to the hook. The
    /// configured slot wins over the one found by address.
    fn route_activity_tickle(&self, patcher: &dyn KernelPatcher) -> Result<usize> {
        let slot = match self.config.activity_tickle_slot {
            Some(slot) => slot,
            None => {
                let stock = patcher
                    .solve_symbol(symbols::SERVICE_ACTIVITY_TICKLE)
                    .filter(|&addr| addr != 0)
                    .ok_or_else(|| Error::SymbolNotFound(symbols::SERVICE_ACTIVITY_TICKLE.into()))?;
                find_vtable_slot(patcher, symbols::CONTROLLER_VTABLE, stock).ok_or_else(|| {
                    Error::InterceptionFailed(format!(
                        "activityTickle (no slot in {})",
                        symbols::CONTROLLER_VTABLE
                    ))
                })?
            }
        };
        if self.kext.functions.activity_tickle.route_virtual(
            patcher,
            symbols::CONTROLLER_VTABLE,
            slot,
            activity_tickle_hook,
        ) {
            Ok(slot)
        } else {
            Err(Error::InterceptionFailed(format!(
                "{}+{:#x}",
                symbols::CONTROLLER_VTABLE,
                slot
            )))
        }
    }

    pub fn on_controller_matched(&self, controller: ServiceId) {
        if !self.config.enabled {
            return;
        }
        self.registry.add(controller);
        self.sweep();
    }

    pub fn on_controller_terminated(&self, controller: ServiceId) {
        self.registry.remove(controller);
    }

    /// Process every entry that is not done yet. Nothing happens before the
    /// image is resolved.
    pub fn sweep(&self) {
        if !self.is_solved() {
            debug!("Sweep skipped, driver image not resolved");
            return;
        }
        let _guard = self.sweep_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let configurator = Configurator {
            platform: self.platform.as_ref(),
            driver: &self.driver,
            registry: &self.registry,
            config: &self.config,
            quirks: &self.quirks,
        };
        for entry in self.registry.entries() {
            configurator.process(&entry);
        }
    }

    /// Note activity on `controller` and pass it on to its proxy.
    ///
    /// Skipped while the entry is locked: the driver may tickle from inside a
    /// command the plugin itself is waiting on.
    pub fn record_activity(&self, controller: ServiceId) -> bool {
        let Some(entry) = self.registry.lookup(controller) else {
            return false;
        };
        let Some(mut state) = entry.try_lock() else {
            return false;
        };
        if state.is_torn_down() {
            return false;
        }
        state.last_active = Some(Instant::now());
        if let Some(pm) = &state.pm {
            pm.activity_tickle();
        }
        true
    }
}

extern "C" fn activity_tickle_hook(service: *mut c_void, kind: u64, state: u64) -> bool {
    let Some(plugin) = Plugin::global() else {
        return false;
    };
    plugin.record_activity(ServiceId::from_ptr(service));
    (plugin.kext.functions.activity_tickle.get())(service, kind, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerState;
    use crate::memory::MockMemoryBuilder;
    use crate::mock::{MockDriver, MockPlatform};
    use crate::nvme::{IdentifyController, PowerStateDescriptor};
    use crate::offset::{MemberId, StaticOffsets};
    use crate::patch::MockPatcher;
    use crate::pm::PowerAck;

    const CTRL: ServiceId = ServiceId::from_raw(0x1000);

    fn ident() -> IdentifyController {
        IdentifyController {
            vid: 0x144d,
            model: "Samsung SSD 970 EVO Plus 1TB".to_string(),
            npss: 1,
            apsta: 1,
            power_states: vec![
                PowerStateDescriptor::default(),
                PowerStateDescriptor {
                    flags: 2,
                    entry_lat: 100,
                    exit_lat: 100,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn register_symbols(patcher: &MockPatcher) {
        let names = [
            symbols::ISSUE_IDENTIFY_COMMAND,
            symbols::PROCESS_SYNC_NVME_REQUEST,
            symbols::GET_REQUEST,
            symbols::RETURN_REQUEST,
            symbols::REQUEST_BUILD_GET_FEATURES,
            symbols::REQUEST_BUILD_SET_FEATURES,
        ];
        for (i, name) in names.iter().enumerate() {
            patcher.add_symbol(name, 0x9000 + i as u64 * 0x10);
        }
    }

    fn accessor_symbols(patcher: &MockPatcher, base: u64) {
        patcher.add_symbol(symbols::REQUEST_GET_STATUS, base + 0x100);
        patcher.add_symbol(symbols::REQUEST_GET_OPCODE, base + 0x200);
        patcher.add_symbol(symbols::REQUEST_GENERATE_IOVM_SEGMENTS, base + 0x300);
        patcher.add_symbol(symbols::CONTROLLER_FILTER_INTERRUPT_REQUEST, base + 0x400);
    }

    fn offsets() -> StaticOffsets {
        StaticOffsets::new("test")
            .with(MemberId::RequestResult, 0x2c)
            .with(MemberId::RequestCommand, 0x30)
            .with(MemberId::RequestPrpDescriptor, 0x90)
    }

    fn plugin(config: Config) -> (Plugin, Arc<MockPlatform>, Arc<MockDriver>) {
        let platform = Arc::new(MockPlatform::new());
        let driver = Arc::new(MockDriver::new());
        driver.set_identify(ident().to_bytes());
        let plugin = Plugin::with_driver(
            config,
            platform.clone(),
            Arc::new(Kext::new()),
            driver.clone(),
        );
        (plugin, platform, driver)
    }

    #[test]
    fn test_match_before_image_waits_for_solve() {
        let (plugin, _platform, driver) = plugin(Config::default());
        plugin.on_controller_matched(CTRL);
        assert_eq!(driver.identify_count(), 0);

        let patcher = MockPatcher::new();
        register_symbols(&patcher);
        accessor_symbols(&patcher, 0x4000);
        plugin.solve_with(&patcher, &offsets()).unwrap();

        assert!(plugin.is_solved());
        let entry = plugin.registry().lookup(CTRL).unwrap();
        assert_eq!(entry.state(), ControllerState::Configured);
    }

    #[test]
    fn test_unresolved_image_blocks_processing() {
        let (plugin, _platform, driver) = plugin(Config::default());
        let patcher = MockPatcher::new();
        register_symbols(&patcher);

        assert!(plugin.solve_with(&patcher, &offsets()).is_err());
        assert!(!plugin.is_solved());
        plugin.on_controller_matched(CTRL);
        assert_eq!(driver.identify_count(), 0);
    }

    #[test]
    fn test_disabled_plugin_ignores_matches() {
        let (plugin, _platform, driver) = plugin(Config::from_boot_args("-nvmefixoff"));
        let patcher = MockPatcher::new();
        plugin
            .on_image_loaded(&patcher, MockMemoryBuilder::new().build())
            .unwrap();
        plugin.on_controller_matched(CTRL);
        assert!(plugin.registry().is_empty());
        assert_eq!(driver.identify_count(), 0);
    }

    #[test]
    fn test_image_scan_discovers_members() {
        let image = MockMemoryBuilder::new()
            .base(0x4000)
            .with_size(0x500)
            // mov eax, [rdi+0x28]; ret
            .write_bytes(0x100, &[0x8B, 0x47, 0x28, 0xC3])
            // movzx eax, byte [rdi+0x30]; ret
            .write_bytes(0x200, &[0x0F, 0xB6, 0x47, 0x30, 0xC3])
            // mov rax, [rbx+0x18]; mov rdi, [rbx+0x90]
            .write_bytes(
                0x300,
                &[0x48, 0x8B, 0x43, 0x18, 0x48, 0x8B, 0xBB, 0x90, 0x00, 0x00, 0x00, 0xC3],
            )
            // cmp byte [rdi+0x1a0], 0
            .write_bytes(0x400, &[0x80, 0xBF, 0xA0, 0x01, 0x00, 0x00, 0x00, 0xC3])
            .build();
        let patcher = MockPatcher::new();
        register_symbols(&patcher);
        accessor_symbols(&patcher, 0x4000);

        let (plugin, _platform, _driver) = plugin(Config::default());
        plugin.on_image_loaded(&patcher, image).unwrap();

        let members = &plugin.kext().members;
        assert_eq!(members.result.offset(), Some(0x2c));
        assert_eq!(members.command.offset(), Some(0x30));
        assert_eq!(members.controller.offset(), Some(0x18));
        assert_eq!(members.prp_descriptor.offset(), Some(0x90));
        assert_eq!(members.msi_workaround.offset(), Some(0x1a0));
    }

    #[test]
    fn test_terminate_and_deinit_release_entries() {
        let (plugin, platform, _driver) = plugin(Config::default());
        let patcher = MockPatcher::new();
        register_symbols(&patcher);
        accessor_symbols(&patcher, 0x4000);
        plugin.solve_with(&patcher, &offsets()).unwrap();

        plugin.on_controller_matched(CTRL);
        plugin.on_controller_matched(ServiceId::from_raw(0x2000));
        assert_eq!(platform.live_proxies(), 2);

        plugin.on_controller_terminated(CTRL);
        assert_eq!(plugin.registry().len(), 1);
        assert_eq!(platform.live_proxies(), 1);

        plugin.deinit();
        assert!(plugin.registry().is_empty());
        assert_eq!(platform.live_proxies(), 0);
        assert_eq!(platform.live_buffers(), 0);
    }

    #[test]
    fn test_activity_defers_power_drop() {
        let (plugin, platform, _driver) = plugin(Config::default());
        let patcher = MockPatcher::new();
        register_symbols(&patcher);
        accessor_symbols(&patcher, 0x4000);
        plugin.solve_with(&patcher, &offsets()).unwrap();
        plugin.on_controller_matched(CTRL);

        let proxy = platform.attached_proxy(CTRL).unwrap();
        proxy.power_state_did_change_to(2);
        assert_eq!(proxy.set_power_state(1), PowerAck::Implied);

        assert!(plugin.record_activity(CTRL));
        assert_eq!(proxy.set_power_state(1), PowerAck::Busy);
        assert!(platform.proxy_events().contains(&"tickle".to_string()));

        assert!(!plugin.record_activity(ServiceId::from_raw(0x7000)));
    }

    extern "C" fn stock_tickle(_service: *mut c_void, _kind: u64, _state: u64) -> bool {
        true
    }

    #[test]
    fn test_activity_hook_found_by_address() {
        let (plugin, _platform, _driver) = plugin(Config::default());
        let patcher = MockPatcher::new();
        register_symbols(&patcher);
        accessor_symbols(&patcher, 0x4000);

        let stock = stock_tickle as usize as u64;
        let mut vtable = Box::new([0u64, 0, 0x5000, 0x6000, stock, 0]);
        patcher.add_symbol(symbols::CONTROLLER_VTABLE, vtable.as_mut_ptr() as u64);
        patcher.add_symbol(symbols::SERVICE_ACTIVITY_TICKLE, stock);

        plugin.solve_with(&patcher, &offsets()).unwrap();

        let tickle = &plugin.kext().functions.activity_tickle;
        assert!(tickle.is_routed());
        assert_eq!(tickle.original(), Some(stock));
        assert_eq!(vtable[4], activity_tickle_hook as usize as u64);
        assert_eq!(vtable[2], 0x5000);
    }

    #[test]
    fn test_activity_hook_configured_slot() {
        let config = Config {
            activity_tickle_slot: Some(0x10),
            ..Default::default()
        };
        let (plugin, _platform, _driver) = plugin(config);
        let patcher = MockPatcher::new();
        register_symbols(&patcher);
        accessor_symbols(&patcher, 0x4000);

        let stock = stock_tickle as usize as u64;
        let mut vtable = Box::new([0u64, 0, stock, 0]);
        patcher.add_symbol(symbols::CONTROLLER_VTABLE, vtable.as_mut_ptr() as u64);

        plugin.solve_with(&patcher, &offsets()).unwrap();

        let tickle = &plugin.kext().functions.activity_tickle;
        assert!(tickle.is_routed());
        assert_eq!(tickle.original(), Some(stock));
        assert_eq!(vtable[2], activity_tickle_hook as usize as u64);
    }

    #[test]
    fn test_activity_hook_missing_is_not_fatal() {
        let (plugin, _platform, _driver) = plugin(Config::default());
        let patcher = MockPatcher::new();
        register_symbols(&patcher);
        accessor_symbols(&patcher, 0x4000);

        let stock = stock_tickle as usize as u64;
        let mut vtable = Box::new([0u64, 0, 0x5000, 0]);
        patcher.add_symbol(symbols::CONTROLLER_VTABLE, vtable.as_mut_ptr() as u64);
        patcher.add_symbol(symbols::SERVICE_ACTIVITY_TICKLE, stock);

        let err = plugin.route_activity_tickle(&patcher).unwrap_err();
        assert!(matches!(err, Error::InterceptionFailed(_)));

        plugin.solve_with(&patcher, &offsets()).unwrap();
        assert!(plugin.is_solved());
        assert!(!plugin.kext().functions.activity_tickle.is_routed());
        assert_eq!(vtable[2], 0x5000);
    }

    #[test]
    fn test_activity_hook_without_symbol() {
        let (plugin, _platform, _driver) = plugin(Config::default());
        let patcher = MockPatcher::new();
        assert!(matches!(
            plugin.route_activity_tickle(&patcher),
            Err(Error::SymbolNotFound(_))
        ));
    }
}
