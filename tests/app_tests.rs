use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lamp_switch::{
    AppConfig, AppError, Application, DatapointStore, DeviceIdentity, DeviceStack,
    MockGpioBackend, ShellState, SwitchValue,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
struct FakeStack {
    first_run: bool,
    fail_start: bool,
    fail_service_after: Option<usize>,
    panic_service_after: Option<usize>,
    starts: AtomicUsize,
    services: AtomicUsize,
    stops: AtomicUsize,
    names: Mutex<Vec<String>>,
    identity: Mutex<Option<DeviceIdentity>>,
}

impl DeviceStack for FakeStack {
    fn start(&self, _store: Arc<DatapointStore>, identity: DeviceIdentity) -> Result<(), AppError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            return Err(AppError::Stack("start refused".into()));
        }
        *self.identity.lock() = Some(identity);
        Ok(())
    }

    fn is_first_run(&self) -> bool {
        self.first_run
    }

    fn set_device_name(&self, name: &str) -> Result<(), AppError> {
        self.names.lock().push(name.to_string());
        Ok(())
    }

    fn service(&self) -> Result<(), AppError> {
        let n = self.services.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.panic_service_after
            && n > limit
        {
            panic!("device stack crashed");
        }
        match self.fail_service_after {
            Some(limit) if n > limit => Err(AppError::Stack("link lost".into())),
            _ => Ok(()),
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn app(stack: FakeStack) -> (
    Application<MockGpioBackend, FakeStack>,
    Arc<FakeStack>,
    Arc<MockGpioBackend>,
) {
    let mut config = AppConfig::default();
    config.service_interval_ms = 10;
    let backend = Arc::new(MockGpioBackend::default());
    let stack = Arc::new(stack);
    let app = Application::new(Arc::new(config), backend.clone(), stack.clone());
    (app, stack, backend)
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn configure_starts_stack_and_claims_pins() {
    let (mut app, stack, backend) = app(FakeStack::default());
    assert_eq!(app.state(), ShellState::Uninitialized);

    app.configure().unwrap();

    assert_eq!(app.state(), ShellState::Configured);
    assert_eq!(stack.starts.load(Ordering::SeqCst), 1);
    assert_eq!(backend.claimed(), vec![4, 17, 22, 23, 24, 25]);
    let identity = stack.identity.lock().clone().unwrap();
    assert_eq!(identity.program_id, "9F:FF:FF:05:00:0A:A0:03");
    // not a first run: the name is left alone
    assert!(stack.names.lock().is_empty());

    assert!(matches!(app.configure(), Err(AppError::InvalidState(_))));
}

#[tokio::test]
async fn first_run_names_the_device() {
    let (mut app, stack, _backend) = app(FakeStack {
        first_run: true,
        ..FakeStack::default()
    });

    app.configure().unwrap();

    let names = stack.names.lock().clone();
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with("-3Ch-Lamp-Switch"));
}

#[tokio::test]
async fn failed_configure_releases_everything() {
    let (mut app, stack, backend) = app(FakeStack {
        fail_start: true,
        ..FakeStack::default()
    });

    assert!(app.configure().is_err());

    assert_eq!(app.state(), ShellState::Stopped);
    assert_eq!(stack.stops.load(Ordering::SeqCst), 1);
    assert!(backend.claimed().is_empty());
}

#[tokio::test]
async fn run_requires_configure() {
    let (mut app, stack, _backend) = app(FakeStack::default());

    let result = app
        .run(tokio_stream::iter(Vec::<String>::new()), std::future::pending())
        .await;

    assert!(matches!(result, Err(AppError::InvalidState(_))));
    assert_eq!(stack.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn buttons_and_lamp_updates_flow_through_the_loop() {
    let (mut app, stack, backend) = app(FakeStack::default());
    app.configure().unwrap();
    let registry = app.registry().unwrap();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<String>();

    let driver = async {
        backend.press(24).unwrap();
        let lamp = registry.lamp_points(2).unwrap().input;
        registry
            .store()
            .network_write(lamp, SwitchValue::new(100.0, 1))
            .unwrap();

        wait_for(|| {
            registry.switch_channel(1).unwrap().output_state == 1
                && registry.lamp_channel(2).unwrap().physical_output
        })
        .await;
        assert!(lamp_switch::GpioBackend::read_value(backend.as_ref(), 22).unwrap());

        cmd_tx.send("status".into()).unwrap();
        cmd_tx.send("quit".into()).unwrap();
    };
    let run = app.run(UnboundedReceiverStream::new(cmd_rx), std::future::pending());
    let (result, ()) = tokio::join!(run, driver);

    result.unwrap();
    assert_eq!(app.state(), ShellState::Stopped);

    let switch = registry.switch_channel(1).unwrap();
    assert_eq!((switch.output_value, switch.output_state), (100.0, 1));
    assert_eq!((switch.feedback_value, switch.feedback_state), (100.0, 1));
    let lamp = registry.lamp_channel(2).unwrap();
    assert_eq!((lamp.feedback_value, lamp.feedback_state), (100.0, 1));
    for i in [0, 2] {
        assert_eq!(registry.switch_channel(i).unwrap().output_state, 0);
    }

    assert_eq!(stack.stops.load(Ordering::SeqCst), 1);
    assert!(backend.claimed().is_empty());
}

#[tokio::test]
async fn switch_feedback_write_updates_switch_output() {
    let (mut app, _stack, _backend) = app(FakeStack::default());
    app.configure().unwrap();
    let registry = app.registry().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let driver = async {
        let feedback = registry.switch_points(0).unwrap().feedback;
        registry
            .store()
            .network_write(feedback, SwitchValue::ON)
            .unwrap();
        wait_for(|| registry.switch_channel(0).unwrap().output_state == 1).await;
        stop_tx.send(()).unwrap();
    };
    let run = app.run(tokio_stream::pending(), async {
        let _ = stop_rx.await;
    });
    let (result, ()) = tokio::join!(run, driver);

    result.unwrap();
    assert_eq!(registry.switch_channel(0).unwrap().output_value, 100.0);
}

#[tokio::test]
async fn shutdown_mid_loop_cleans_up_once() {
    let (mut app, stack, backend) = app(FakeStack::default());
    app.configure().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let driver = async {
        wait_for(|| stack.services.load(Ordering::SeqCst) >= 3).await;
        stop_tx.send(()).unwrap();
    };
    let run = app.run(tokio_stream::pending(), async {
        let _ = stop_rx.await;
    });
    let (result, ()) = tokio::join!(run, driver);

    result.unwrap();
    assert_eq!(app.state(), ShellState::Stopped);
    assert_eq!(stack.stops.load(Ordering::SeqCst), 1);
    assert!(backend.claimed().is_empty());
}

#[tokio::test]
async fn stack_failure_ends_loop_and_cleans_up_once() {
    let (mut app, stack, backend) = app(FakeStack {
        fail_service_after: Some(2),
        ..FakeStack::default()
    });
    app.configure().unwrap();

    let result = app
        .run(tokio_stream::pending(), std::future::pending())
        .await;

    assert!(matches!(result, Err(AppError::Stack(_))));
    assert_eq!(app.state(), ShellState::Stopped);
    assert_eq!(stack.stops.load(Ordering::SeqCst), 1);
    assert!(backend.claimed().is_empty());
}

#[tokio::test]
async fn closed_command_input_keeps_running() {
    let (mut app, stack, _backend) = app(FakeStack {
        fail_service_after: Some(5),
        ..FakeStack::default()
    });
    app.configure().unwrap();

    // commands end immediately; the loop only stops when the stack fails
    let result = app
        .run(
            tokio_stream::iter(vec!["help".to_string(), "bogus".to_string()]),
            std::future::pending(),
        )
        .await;

    assert!(result.is_err());
    assert!(stack.services.load(Ordering::SeqCst) > 5);
}

#[tokio::test]
async fn panic_in_loop_cleans_up_once() {
    let (mut app, stack, backend) = app(FakeStack {
        panic_service_after: Some(2),
        ..FakeStack::default()
    });
    app.configure().unwrap();

    let task = tokio::spawn(async move {
        app.run(tokio_stream::pending::<String>(), std::future::pending())
            .await
    });
    let joined = task.await;

    assert!(joined.unwrap_err().is_panic());
    assert_eq!(stack.stops.load(Ordering::SeqCst), 1);
    assert!(backend.claimed().is_empty());
}

#[tokio::test]
async fn dropping_run_future_cleans_up_once() {
    let (mut app, stack, backend) = app(FakeStack::default());
    app.configure().unwrap();

    tokio::select! {
        _ = app.run(tokio_stream::pending::<String>(), std::future::pending()) => {
            panic!("run returned without a shutdown request");
        }
        _ = wait_for(|| stack.services.load(Ordering::SeqCst) >= 3) => {}
    }

    assert_eq!(stack.stops.load(Ordering::SeqCst), 1);
    assert!(backend.claimed().is_empty());
    // the wiring was consumed by the cancelled run
    assert!(matches!(
        app.run(tokio_stream::pending::<String>(), std::future::pending())
            .await,
        Err(AppError::InvalidState(_))
    ));
    assert_eq!(stack.stops.load(Ordering::SeqCst), 1);
}
