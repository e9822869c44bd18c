use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use purification::{PurifyOutcome, PurifyState};
use respawn::{
    ChildProcess, ChildProcessController, ChildRequest, ChildRequestBlock, ControllerConfig,
    Event, OperationContext, RespawnError, RespawnResult, BLOCK_SIZE,
};

const IMAGE_PATH: &str = "/opt/vmguard/bin/vmsup";
const IMAGE_BASE: u64 = 0x40_0000;
const BLOCK_OFFSET: u64 = 0x2000;
const BLOCK_ADDR: u64 = IMAGE_BASE + BLOCK_OFFSET;
const RUNTIME_BASE: u64 = 0x7f77_0000_0000;

type Log = Arc<Mutex<Vec<String>>>;

fn log_push(log: &Log, entry: &str) {
    log.lock().unwrap().push(entry.to_string());
}

fn log_index(log: &Log, entry: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{} not in log: {:?}", entry, log.lock().unwrap()))
}

struct FakeEvent {
    name: &'static str,
    signaled: Arc<AtomicBool>,
    log: Log,
    on_signal: Option<Box<dyn Fn() + Send + Sync>>,
}

impl FakeEvent {
    fn new(name: &'static str, log: Log) -> Self {
        Self {
            name,
            signaled: Arc::new(AtomicBool::new(false)),
            log,
            on_signal: None,
        }
    }
}

impl Event for FakeEvent {
    fn signal(&self) -> RespawnResult<()> {
        log_push(&self.log, &format!("signal:{}", self.name));
        self.signaled.store(true, Ordering::SeqCst);
        if let Some(hook) = &self.on_signal {
            hook();
        }
        Ok(())
    }

    fn wait(&self, _timeout: Duration) -> RespawnResult<bool> {
        Ok(self.signaled.swap(false, Ordering::SeqCst))
    }

    fn raw_handle(&self) -> u64 {
        0
    }
}

#[derive(Clone, Copy)]
enum ChildScript {
    /// Post the purify request on resume, close events once allowed onward.
    Cooperative,
    /// Post an error report on resume instead of the purify request.
    ErrorReport,
    /// Never signal anything.
    Silent,
    /// Die without ever posting a request.
    DiesSilently,
    /// Post the wrong request code on resume.
    WrongRequest,
}

struct FakeChild {
    script: ChildScript,
    memory: Arc<Mutex<Vec<u8>>>,
    writes: Vec<ChildRequestBlock>,
    parent_signaled: Arc<AtomicBool>,
    log: Log,
    downgraded: bool,
    exit_code: i32,
}

impl FakeChild {
    fn new(script: ChildScript, log: Log, parent_signaled: Arc<AtomicBool>) -> Self {
        Self {
            script,
            memory: Arc::new(Mutex::new(vec![0u8; BLOCK_SIZE])),
            writes: Vec::new(),
            parent_signaled,
            log,
            downgraded: false,
            exit_code: 0,
        }
    }

    fn post_request(memory: &Arc<Mutex<Vec<u8>>>, block: ChildRequestBlock) {
        *memory.lock().unwrap() = block.to_bytes();
    }
}

impl ChildProcess for FakeChild {
    fn pid(&self) -> u32 {
        4242
    }

    fn module_base(&mut self, expected_path: &str) -> RespawnResult<u64> {
        if expected_path == IMAGE_PATH {
            Ok(IMAGE_BASE)
        } else {
            Ok(RUNTIME_BASE)
        }
    }

    fn read_memory(&mut self, addr: u64, buf: &mut [u8]) -> RespawnResult<()> {
        assert_eq!(addr, BLOCK_ADDR);
        buf.copy_from_slice(&self.memory.lock().unwrap()[..buf.len()]);
        Ok(())
    }

    fn write_memory(&mut self, addr: u64, bytes: &[u8]) -> RespawnResult<()> {
        assert_eq!(addr, BLOCK_ADDR);
        assert!(!self.downgraded, "write after downgrade");
        *self.memory.lock().unwrap() = bytes.to_vec();
        if let Some(block) = ChildRequestBlock::from_bytes(bytes) {
            self.writes.push(block);
        }
        Ok(())
    }

    fn resume(&mut self) -> RespawnResult<()> {
        log_push(&self.log, "resume");
        let mut block = ChildRequestBlock::new();
        match self.script {
            ChildScript::Cooperative => {
                block.set_request(ChildRequest::PurifyAndCloseHandles);
            }
            ChildScript::ErrorReport => {
                block.set_error(
                    "earlyInit/verifySelf",
                    OperationContext::Verification,
                    0xbeef,
                    "module /tmp/injected.so failed verification",
                );
            }
            ChildScript::WrongRequest => {
                block.set_request(ChildRequest::CloseEvents);
            }
            ChildScript::Silent | ChildScript::DiesSilently => return Ok(()),
        }
        Self::post_request(&self.memory, block);
        self.parent_signaled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn try_wait_exit(&mut self) -> RespawnResult<Option<i32>> {
        match self.script {
            ChildScript::DiesSilently => Ok(Some(9)),
            _ => Ok(None),
        }
    }

    fn downgrade_handles(&mut self) -> RespawnResult<()> {
        log_push(&self.log, "downgrade");
        self.downgraded = true;
        Ok(())
    }

    fn wait_exit(&mut self) -> RespawnResult<i32> {
        log_push(&self.log, "wait_exit");
        Ok(self.exit_code)
    }

    fn terminate(&mut self) -> RespawnResult<()> {
        log_push(&self.log, "terminate");
        Ok(())
    }
}

fn clean_outcome() -> PurifyOutcome {
    PurifyOutcome {
        passes: 1,
        total_fixes: 0,
        state: PurifyState::Clean,
        transitions: vec![PurifyState::Clean],
    }
}

struct Setup {
    controller: ChildProcessController,
    child: FakeChild,
    parent_event: FakeEvent,
    child_event: FakeEvent,
    log: Log,
}

fn setup(script: ChildScript) -> Setup {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let parent_event = FakeEvent::new("parent", log.clone());
    let child = FakeChild::new(script, log.clone(), parent_event.signaled.clone());

    // When the controller lets the child proceed, the scripted child answers
    // with a close-events request.
    let mut child_event = FakeEvent::new("child", log.clone());
    if matches!(script, ChildScript::Cooperative) {
        let memory = child.memory.clone();
        let parent_signaled = child.parent_signaled.clone();
        child_event.on_signal = Some(Box::new(move || {
            let mut block = ChildRequestBlock::new();
            block.set_request(ChildRequest::CloseEvents);
            FakeChild::post_request(&memory, block);
            parent_signaled.store(true, Ordering::SeqCst);
        }));
    }

    let mut config = ControllerConfig::new(IMAGE_PATH, BLOCK_OFFSET);
    // Keep the silent-child tests quick; correctness never depends on the
    // ceiling's magnitude.
    config.request_timeout = Duration::from_millis(300);
    Setup {
        controller: ChildProcessController::new(config),
        child,
        parent_event,
        child_event,
        log,
    }
}

#[test]
fn cooperative_child_runs_the_full_handshake_and_mirrors_exit_code() {
    let mut s = setup(ChildScript::Cooperative);
    s.child.exit_code = 42;
    let mut purify =
        |_: &mut dyn ChildProcess| -> RespawnResult<PurifyOutcome> { Ok(clean_outcome()) };

    let code = s
        .controller
        .supervise(&mut s.child, &s.parent_event, &s.child_event, &mut purify)
        .expect("handshake");
    assert_eq!(code, 42);
    assert!(!s.log.lock().unwrap().iter().any(|e| e == "terminate"));
}

#[test]
fn proceed_signal_comes_after_purification_and_downgrade() {
    let mut s = setup(ChildScript::Cooperative);
    let log = s.log.clone();
    let mut purify = move |_: &mut dyn ChildProcess| -> RespawnResult<PurifyOutcome> {
        log_push(&log, "purify");
        Ok(clean_outcome())
    };

    s.controller
        .supervise(&mut s.child, &s.parent_event, &s.child_event, &mut purify)
        .expect("handshake");

    let purify_at = log_index(&s.log, "purify");
    let downgrade_at = log_index(&s.log, "downgrade");
    let proceed_at = log_index(&s.log, "signal:child");
    assert!(purify_at < proceed_at, "purification must precede the signal");
    assert!(downgrade_at < proceed_at, "downgrade must precede the signal");
}

#[test]
fn runtime_base_is_scrambled_until_purification_completes() {
    let mut s = setup(ChildScript::Cooperative);
    let mut purify =
        |_: &mut dyn ChildProcess| -> RespawnResult<PurifyOutcome> { Ok(clean_outcome()) };

    s.controller
        .supervise(&mut s.child, &s.parent_event, &s.child_event, &mut purify)
        .expect("handshake");

    let planted = &s.child.writes[0];
    let restored = &s.child.writes[1];
    assert_ne!(planted.runtime_base, RUNTIME_BASE, "planted base must be bogus");
    assert_eq!(restored.runtime_base, RUNTIME_BASE);
    assert_eq!(restored.request(), Some(ChildRequest::None));
    assert_eq!(restored.status, 0, "stale fields must be wiped");
}

#[test]
fn child_error_report_is_surfaced_verbatim_and_child_terminated() {
    let mut s = setup(ChildScript::ErrorReport);
    let mut purify = |_: &mut dyn ChildProcess| -> RespawnResult<PurifyOutcome> {
        panic!("must not purify after an error report")
    };

    let err = s
        .controller
        .supervise(&mut s.child, &s.parent_event, &s.child_event, &mut purify)
        .unwrap_err();
    match err {
        RespawnError::ChildReported {
            where_tag,
            context,
            status,
            message,
        } => {
            assert_eq!(where_tag, "earlyInit/verifySelf");
            assert_eq!(context, OperationContext::Verification as u32);
            assert_eq!(status, 0xbeef);
            assert_eq!(message, "module /tmp/injected.so failed verification");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    log_index(&s.log, "terminate");
}

#[test]
fn silent_child_times_out_and_is_terminated() {
    let mut s = setup(ChildScript::Silent);
    let mut purify =
        |_: &mut dyn ChildProcess| -> RespawnResult<PurifyOutcome> { Ok(clean_outcome()) };

    let err = s
        .controller
        .supervise(&mut s.child, &s.parent_event, &s.child_event, &mut purify)
        .unwrap_err();
    assert!(matches!(err, RespawnError::Timeout { .. }), "{:?}", err);
    log_index(&s.log, "terminate");
}

#[test]
fn dead_child_is_reported_before_the_request_timeout() {
    let mut s = setup(ChildScript::DiesSilently);
    let mut purify =
        |_: &mut dyn ChildProcess| -> RespawnResult<PurifyOutcome> { Ok(clean_outcome()) };

    let err = s
        .controller
        .supervise(&mut s.child, &s.parent_event, &s.child_event, &mut purify)
        .unwrap_err();
    match err {
        RespawnError::Protocol { detail } => {
            assert!(detail.contains("exited with code 9"), "{}", detail);
        }
        other => panic!("expected immediate protocol error, got {:?}", other),
    }
    log_index(&s.log, "terminate");
}

#[test]
fn unexpected_request_code_is_a_protocol_error() {
    let mut s = setup(ChildScript::WrongRequest);
    let mut purify =
        |_: &mut dyn ChildProcess| -> RespawnResult<PurifyOutcome> { Ok(clean_outcome()) };

    let err = s
        .controller
        .supervise(&mut s.child, &s.parent_event, &s.child_event, &mut purify)
        .unwrap_err();
    assert!(matches!(err, RespawnError::Protocol { .. }), "{:?}", err);
    log_index(&s.log, "terminate");
}

#[test]
fn non_converging_purification_aborts_the_launch() {
    let mut s = setup(ChildScript::Cooperative);
    let mut purify = |_: &mut dyn ChildProcess| -> RespawnResult<PurifyOutcome> {
        Ok(PurifyOutcome {
            passes: 16,
            total_fixes: 16,
            state: PurifyState::GivingUp {
                outstanding_fixes: 3,
            },
            transitions: Vec::new(),
        })
    };

    let err = s
        .controller
        .supervise(&mut s.child, &s.parent_event, &s.child_event, &mut purify)
        .unwrap_err();
    match err {
        RespawnError::Unrecoverable { outstanding_fixes } => assert_eq!(outstanding_fixes, 3),
        other => panic!("unexpected error: {:?}", other),
    }
    log_index(&s.log, "terminate");
}
