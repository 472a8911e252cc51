//! Lifecycle tests for handler wrappers: init, back-off, drain and reload.

use stagehand::clock::{MockTimeProvider, SystemTimeProvider};
use stagehand::engine::Context;
use stagehand::error::{HandlerError, LifecycleError};
use stagehand::http::{Request, Response};
use stagehand::servlet::{
    ClassRegistry, Handler, HandlerConfig, HandlerState, HandlerWrapper, INCLUDE_REQUEST_URI,
    INCLUDE_SERVLET_PATH, RegistryLoader,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

type Hook = Arc<dyn Fn(usize) -> Result<(), HandlerError> + Send + Sync>;

/// Shared counters and behavior for [`Scripted`] instances.
#[derive(Clone)]
struct Script {
    inits: Arc<AtomicUsize>,
    services: Arc<AtomicUsize>,
    destroys: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    on_init: Hook,
    on_service: Hook,
    fail_destroy: bool,
    init_delay: Duration,
    service_delay: Duration,
    single_threaded: bool,
    rendezvous: Option<Arc<Barrier>>,
}

impl Script {
    fn new() -> Self {
        Self {
            inits: Arc::default(),
            services: Arc::default(),
            destroys: Arc::default(),
            active: Arc::default(),
            max_active: Arc::default(),
            on_init: Arc::new(|_| Ok(())),
            on_service: Arc::new(|_| Ok(())),
            fail_destroy: false,
            init_delay: Duration::ZERO,
            service_delay: Duration::ZERO,
            single_threaded: false,
            rendezvous: None,
        }
    }

    fn on_init(mut self, f: impl Fn(usize) -> Result<(), HandlerError> + Send + Sync + 'static) -> Self {
        self.on_init = Arc::new(f);
        self
    }

    fn on_service(mut self, f: impl Fn(usize) -> Result<(), HandlerError> + Send + Sync + 'static) -> Self {
        self.on_service = Arc::new(f);
        self
    }

    fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    fn services(&self) -> usize {
        self.services.load(Ordering::SeqCst)
    }

    fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }
}

struct Scripted(Script);

impl Handler for Scripted {
    fn init(&self, _config: &HandlerConfig) -> Result<(), HandlerError> {
        let n = self.0.inits.fetch_add(1, Ordering::SeqCst) + 1;
        thread::sleep(self.0.init_delay);
        (self.0.on_init)(n)
    }

    fn service(&self, _req: &mut Request, res: &mut Response) -> Result<(), HandlerError> {
        let active = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max_active.fetch_max(active, Ordering::SeqCst);

        if let Some(barrier) = &self.0.rendezvous {
            barrier.wait();
        }
        thread::sleep(self.0.service_delay);

        let n = self.0.services.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        res.write("ok");
        (self.0.on_service)(n)
    }

    fn destroy(&self) -> Result<(), HandlerError> {
        self.0.destroys.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_destroy {
            return Err(HandlerError::Fatal("teardown failed".to_string()));
        }
        Ok(())
    }

    fn single_threaded(&self) -> bool {
        self.0.single_threaded
    }
}

fn registry_with(script: &Script) -> Arc<ClassRegistry> {
    let registry = Arc::new(ClassRegistry::new());
    let script = script.clone();
    registry.register("scripted", move || Scripted(script.clone()));
    registry
}

fn wrapper_with(script: &Script, clock: Arc<MockTimeProvider>) -> Arc<HandlerWrapper> {
    let registry = registry_with(script);
    Arc::new(
        HandlerWrapper::builder("h")
            .class("scripted")
            .loader(Arc::new(RegistryLoader::new(registry)))
            .clock(clock)
            .build(),
    )
}

fn call(wrapper: &HandlerWrapper) -> Result<(), LifecycleError> {
    let mut req = Request::get("/");
    let mut res = Response::new();
    wrapper.service(&mut req, &mut res)
}

fn wait_for_in_flight(wrapper: &HandlerWrapper, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while wrapper.in_flight() != n {
        assert!(Instant::now() < deadline, "in-flight count never reached {n}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_service_leaves_no_requests_in_flight() {
    let script = Script::new();
    let wrapper = wrapper_with(&script, Arc::default());

    assert_eq!(wrapper.state(), HandlerState::Unloaded);
    call(&wrapper).unwrap();

    assert_eq!(wrapper.in_flight(), 0);
    assert_eq!(wrapper.state(), HandlerState::Initialized);
    assert_eq!(script.inits(), 1);
    assert_eq!(script.services(), 1);
}

#[test]
fn test_concurrent_init_runs_once() {
    let mut script = Script::new();
    script.init_delay = Duration::from_millis(50);
    let wrapper = wrapper_with(&script, Arc::default());

    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let wrapper = Arc::clone(&wrapper);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                wrapper.init()
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(script.inits(), 1);
    assert!(wrapper.is_initialized());
}

#[test]
fn test_concurrent_init_failure_is_shared() {
    let mut script = Script::new().on_init(|_| Err(HandlerError::Fatal("no database".into())));
    script.init_delay = Duration::from_millis(20);
    let wrapper = wrapper_with(&script, Arc::default());

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let wrapper = Arc::clone(&wrapper);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                wrapper.init()
            })
        })
        .collect();

    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, LifecycleError::Fatal(cause) if cause.to_string() == "no database"));
    }
    assert_eq!(script.inits(), 1);
}

#[test]
fn test_retryable_init_backs_off_then_retries() {
    let clock = Arc::new(MockTimeProvider::default());
    let script = Script::new().on_init(|n| {
        if n == 1 {
            Err(HandlerError::unavailable("warming up", 5))
        } else {
            Ok(())
        }
    });
    let wrapper = wrapper_with(&script, Arc::clone(&clock));

    let err = call(&wrapper).unwrap_err();
    assert_eq!(err.retry_after(), Some(5));
    assert_eq!(wrapper.state(), HandlerState::Unavailable);
    assert!(!wrapper.is_loaded());

    clock.advance(Duration::from_secs(2));
    let err = call(&wrapper).unwrap_err();
    assert!(matches!(
        &err,
        LifecycleError::Unavailable { message, retry_after: Some(3) } if message == "warming up"
    ));
    assert_eq!(script.inits(), 1);
    assert_eq!(script.services(), 0);

    clock.advance(Duration::from_secs(4));
    call(&wrapper).unwrap();
    assert_eq!(script.inits(), 2);
    assert_eq!(script.services(), 1);
    assert_eq!(wrapper.unavailable_until(), None);
}

#[test]
fn test_remaining_back_off_rounds_up() {
    let clock = Arc::new(MockTimeProvider::default());
    let script = Script::new().on_init(|_| Err(HandlerError::unavailable("busy", 5)));
    let wrapper = wrapper_with(&script, Arc::clone(&clock));

    assert!(wrapper.init().is_err());

    clock.advance(Duration::from_millis(2500));
    assert_eq!(call(&wrapper).unwrap_err().retry_after(), Some(3));

    clock.advance(Duration::from_millis(2499));
    assert_eq!(call(&wrapper).unwrap_err().retry_after(), Some(1));
}

#[test]
fn test_fatal_init_is_sticky_until_destroy() {
    let clock = Arc::new(MockTimeProvider::default());
    let broken = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&broken);
    let script = Script::new().on_init(move |_| {
        if flag.load(Ordering::SeqCst) {
            Err(HandlerError::Fatal("bad config".into()))
        } else {
            Ok(())
        }
    });
    let wrapper = wrapper_with(&script, Arc::clone(&clock));

    let first = match call(&wrapper).unwrap_err() {
        LifecycleError::Fatal(cause) => cause,
        other => panic!("expected fatal, got {other:?}"),
    };

    clock.advance(Duration::from_secs(3600));
    broken.store(false, Ordering::SeqCst);
    let second = match call(&wrapper).unwrap_err() {
        LifecycleError::Fatal(cause) => cause,
        other => panic!("expected fatal, got {other:?}"),
    };

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(script.inits(), 1);
    assert_eq!(wrapper.unavailable_until(), Some(None));

    wrapper.destroy();
    call(&wrapper).unwrap();
    assert_eq!(script.inits(), 2);
}

#[test]
fn test_retryable_service_failure_opens_window() {
    let clock = Arc::new(MockTimeProvider::default());
    let script = Script::new().on_service(|n| {
        if n == 1 {
            Err(HandlerError::unavailable("overloaded", 10))
        } else {
            Ok(())
        }
    });
    let wrapper = wrapper_with(&script, Arc::clone(&clock));

    assert_eq!(call(&wrapper).unwrap_err().retry_after(), Some(10));
    assert_eq!(wrapper.in_flight(), 0);

    clock.advance(Duration::from_secs(4));
    assert_eq!(call(&wrapper).unwrap_err().retry_after(), Some(6));
    assert_eq!(script.services(), 1);

    clock.advance(Duration::from_secs(6));
    call(&wrapper).unwrap();
    assert_eq!(script.services(), 2);
    // The instance survives a timed window.
    assert_eq!(script.inits(), 1);
}

#[test]
fn test_service_errors_pass_through_without_window() {
    let script = Script::new().on_service(|n| match n {
        1 => Err(HandlerError::Service("bad input".into())),
        2 => Err(HandlerError::Io(std::io::Error::other("broken pipe"))),
        _ => Ok(()),
    });
    let wrapper = wrapper_with(&script, Arc::default());

    assert!(matches!(
        call(&wrapper).unwrap_err(),
        LifecycleError::Handler(HandlerError::Service(msg)) if msg == "bad input"
    ));
    assert!(matches!(
        call(&wrapper).unwrap_err(),
        LifecycleError::Handler(HandlerError::Io(_))
    ));
    assert_eq!(wrapper.unavailable_until(), None);

    call(&wrapper).unwrap();
    assert_eq!(wrapper.state(), HandlerState::Initialized);
}

#[test]
fn test_permanent_unavailability_in_service_releases_instance() {
    let script = Script::new().on_service(|_| Err(HandlerError::permanently_unavailable("retired")));
    let wrapper = wrapper_with(&script, Arc::default());

    let err = call(&wrapper).unwrap_err();
    assert!(matches!(err, LifecycleError::Unavailable { retry_after: None, .. }));
    assert_eq!(script.destroys(), 1);
    assert!(!wrapper.is_loaded());

    let err = call(&wrapper).unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::Unavailable { message, retry_after: None } if message == "retired"
    ));
    assert_eq!(script.services(), 1);
    assert_eq!(wrapper.state(), HandlerState::Unavailable);
}

#[test]
fn test_out_of_range_back_off_is_permanent() {
    let clock = Arc::new(MockTimeProvider::default());
    let script = Script::new().on_init(|_| Err(HandlerError::unavailable("gone for a while", u64::MAX)));
    let wrapper = wrapper_with(&script, Arc::clone(&clock));

    let err = wrapper.init().unwrap_err();
    assert!(matches!(
        &err,
        LifecycleError::Unavailable { message, retry_after: None } if message == "gone for a while"
    ));
    assert_eq!(wrapper.unavailable_until(), Some(None));

    clock.advance(Duration::from_secs(3600));
    assert!(call(&wrapper).is_err());
    assert_eq!(script.inits(), 1);
}

#[test]
fn test_concurrent_callers_respect_window_opened_by_init() {
    let script = Script::new().on_init(|_| Err(HandlerError::unavailable("warming up", 60)));
    let wrapper = wrapper_with(&script, Arc::default());

    let barrier = Arc::new(Barrier::new(16));
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let wrapper = Arc::clone(&wrapper);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                call(&wrapper)
            })
        })
        .collect();

    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, LifecycleError::Unavailable { retry_after: Some(_), .. }));
    }
    assert_eq!(script.inits(), 1);
    assert_eq!(script.services(), 0);
    assert_eq!(wrapper.in_flight(), 0);
}

#[test]
fn test_missing_class_is_not_retried_into_a_window() {
    let registry = Arc::new(ClassRegistry::new());
    let wrapper = HandlerWrapper::builder("ghost")
        .class("nope")
        .loader(Arc::new(RegistryLoader::new(registry)))
        .build();

    for _ in 0..2 {
        let err = wrapper.init().unwrap_err();
        assert!(matches!(err, LifecycleError::ClassResolution { class, .. } if class == "nope"));
    }
    assert_eq!(wrapper.state(), HandlerState::Unloaded);
    assert_eq!(wrapper.unavailable_until(), None);
}

#[test]
fn test_destroy_waits_for_in_flight_requests() {
    let mut script = Script::new();
    script.service_delay = Duration::from_millis(150);
    let registry = registry_with(&script);
    let wrapper = Arc::new(
        HandlerWrapper::builder("slow")
            .class("scripted")
            .loader(Arc::new(RegistryLoader::new(registry)))
            .drain_timeout(Duration::from_secs(5))
            .build(),
    );

    let worker = {
        let wrapper = Arc::clone(&wrapper);
        thread::spawn(move || call(&wrapper))
    };
    wait_for_in_flight(&wrapper, 1);

    wrapper.destroy();
    assert_eq!(wrapper.in_flight(), 0);
    assert_eq!(script.services(), 1);
    assert_eq!(script.destroys(), 1);
    assert_eq!(wrapper.state(), HandlerState::Destroyed);

    worker.join().unwrap().unwrap();
}

#[test]
fn test_destroy_gives_up_after_drain_timeout() {
    let mut script = Script::new();
    script.service_delay = Duration::from_millis(600);
    let registry = registry_with(&script);
    let wrapper = Arc::new(
        HandlerWrapper::builder("stuck")
            .class("scripted")
            .loader(Arc::new(RegistryLoader::new(registry)))
            .drain_timeout(Duration::from_millis(50))
            .build(),
    );

    let worker = {
        let wrapper = Arc::clone(&wrapper);
        thread::spawn(move || call(&wrapper))
    };
    wait_for_in_flight(&wrapper, 1);

    let started = Instant::now();
    wrapper.destroy();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(wrapper.in_flight(), 1);
    assert_eq!(script.destroys(), 1);

    // The straggler still finishes on the instance it already holds.
    worker.join().unwrap().unwrap();
    assert_eq!(wrapper.in_flight(), 0);
}

#[test]
fn test_destroy_swallows_teardown_failure() {
    let mut script = Script::new();
    script.fail_destroy = true;
    let wrapper = wrapper_with(&script, Arc::default());

    wrapper.init().unwrap();
    wrapper.destroy();

    assert_eq!(script.destroys(), 1);
    assert!(!wrapper.is_initialized());
    assert_eq!(wrapper.state(), HandlerState::Destroyed);

    // A destroyed handler comes back on the next request.
    call(&wrapper).unwrap();
    assert_eq!(script.inits(), 2);
    assert_eq!(wrapper.state(), HandlerState::Initialized);
}

#[test]
fn test_reload_swaps_in_new_class() {
    let old = Script::new();
    let registry = registry_with(&old);
    let wrapper = HandlerWrapper::builder("h")
        .class("scripted")
        .reloadable(true)
        .loader(Arc::new(RegistryLoader::new(Arc::clone(&registry))))
        .build();

    call(&wrapper).unwrap();
    assert!(wrapper.has_class());

    let new = Script::new();
    let replacement = new.clone();
    registry.register("scripted", move || Scripted(replacement.clone()));

    call(&wrapper).unwrap();
    assert_eq!(old.destroys(), 1);
    assert_eq!(old.services(), 1);
    assert_eq!(new.inits(), 1);
    assert_eq!(new.services(), 1);

    // Nothing changed since: no further reload.
    call(&wrapper).unwrap();
    assert_eq!(new.inits(), 1);
    assert_eq!(new.destroys(), 0);
}

#[test]
fn test_reload_is_ignored_when_not_reloadable() {
    let old = Script::new();
    let registry = registry_with(&old);
    let wrapper = HandlerWrapper::builder("h")
        .class("scripted")
        .loader(Arc::new(RegistryLoader::new(Arc::clone(&registry))))
        .build();

    call(&wrapper).unwrap();
    registry.touch();
    call(&wrapper).unwrap();

    assert_eq!(old.inits(), 1);
    assert_eq!(old.services(), 2);
}

#[test]
fn test_services_run_concurrently() {
    let mut script = Script::new();
    script.rendezvous = Some(Arc::new(Barrier::new(2)));
    let wrapper = wrapper_with(&script, Arc::default());

    // Both calls must be inside the handler at once to pass the barrier.
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let wrapper = Arc::clone(&wrapper);
            thread::spawn(move || call(&wrapper))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(script.max_active.load(Ordering::SeqCst), 2);
}

#[test]
fn test_single_threaded_handler_is_serialized() {
    let mut script = Script::new();
    script.single_threaded = true;
    script.service_delay = Duration::from_millis(20);
    let wrapper = wrapper_with(&script, Arc::default());

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let wrapper = Arc::clone(&wrapper);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                call(&wrapper)
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(script.services(), 4);
    assert_eq!(script.max_active.load(Ordering::SeqCst), 1);
}

#[test]
fn test_template_handler_uses_sibling_class() {
    let compiler = Script::new();
    let registry = registry_with(&compiler);
    let ctx = Context::new("/app", "/tmp", Arc::new(SystemTimeProvider));
    ctx.set_loader(Arc::new(RegistryLoader::new(registry)));
    ctx.add_handler(HandlerWrapper::builder("jsp").class("scripted"));
    let page = ctx.add_handler(HandlerWrapper::builder("page").template_path("catalog.jsp"));

    let mut req = Request::get("/app/catalog.jsp");
    let mut res = Response::new();
    page.service(&mut req, &mut res).unwrap();

    assert_eq!(page.class_name().as_deref(), Some("scripted"));
    assert_eq!(req.attribute(INCLUDE_REQUEST_URI), Some("/app/catalog.jsp"));
    assert_eq!(req.attribute(INCLUDE_SERVLET_PATH), Some("catalog.jsp"));
    assert_eq!(compiler.services(), 1);
}

#[test]
fn test_template_handler_without_sibling_fails() {
    let ctx = Context::new("", "/tmp", Arc::new(SystemTimeProvider));
    let page = ctx.add_handler(HandlerWrapper::builder("page").template_path("/index.jsp"));

    let err = page.init().unwrap_err();
    assert!(matches!(err, LifecycleError::ClassResolution { class, .. } if class == "jsp"));
}

#[test]
fn test_load_creates_instance_without_init() {
    let script = Script::new();
    let wrapper = wrapper_with(&script, Arc::default());

    wrapper.load().unwrap();
    assert_eq!(wrapper.state(), HandlerState::Loaded);
    assert!(wrapper.has_class());
    assert_eq!(script.inits(), 0);

    wrapper.init().unwrap();
    assert_eq!(wrapper.state(), HandlerState::Initialized);
    assert_eq!(script.inits(), 1);
}

#[test]
fn test_reloadable_context_reloads_its_handlers() {
    let old = Script::new();
    let registry = registry_with(&old);
    let ctx = Context::new("/app", "/tmp", Arc::new(SystemTimeProvider));
    ctx.set_loader(Arc::new(RegistryLoader::new(Arc::clone(&registry))));
    let first = ctx.add_handler(HandlerWrapper::builder("first").class("scripted"));
    let second = ctx.add_handler(HandlerWrapper::builder("second").class("scripted"));

    call(&first).unwrap();
    call(&second).unwrap();
    assert!(!first.is_reloadable());

    ctx.set_reloadable(true);
    assert!(first.is_reloadable());

    let new = Script::new();
    let replacement = new.clone();
    registry.register("scripted", move || Scripted(replacement.clone()));

    // The first call advances the shared loader; the second wrapper still
    // notices its class is from an older generation.
    call(&first).unwrap();
    call(&second).unwrap();
    assert_eq!(old.destroys(), 2);
    assert_eq!(new.inits(), 2);
}
