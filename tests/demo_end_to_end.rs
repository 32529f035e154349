//! End-to-end tests: the demo temperature controller served by a backend and
//! talking to the TCP simulator on localhost.

use fastcs::demo::simulation::{Simulator, SimulatorSettings, TempControllerDevice};
use fastcs::demo::{TemperatureController, TemperatureControllerSettings};
use fastcs_core::{
    ApiRequest, ApiResponse, Backend, BackendConfig, FastCsError, IpConnectionSettings,
    LifecycleState, Value,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct RunningSimulator {
    addr: SocketAddr,
    device: Arc<Mutex<TempControllerDevice>>,
    token: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningSimulator {
    async fn start(ramps: usize) -> Self {
        let simulator = Simulator::bind("127.0.0.1:0", SimulatorSettings::new(ramps))
            .await
            .expect("bind simulator");
        let addr = simulator.local_addr().unwrap();
        let device = simulator.device();
        let token = CancellationToken::new();
        let task = tokio::spawn(simulator.run(token.clone()));
        Self {
            addr,
            device,
            token,
            task,
        }
    }

    async fn stop(self) {
        self.token.cancel();
        self.task.await.unwrap().unwrap();
    }
}

fn controller_settings(addr: SocketAddr, ramps: usize) -> TemperatureControllerSettings {
    let mut ip_settings = IpConnectionSettings::new(addr.ip().to_string(), addr.port());
    ip_settings.response_timeout = Some(Duration::from_secs(1));
    TemperatureControllerSettings {
        num_ramp_controllers: ramps,
        ip_settings,
    }
}

fn backend_for(controller: Arc<TemperatureController>) -> Backend {
    Backend::from_current(controller)
        .unwrap()
        .with_config(BackendConfig {
            shutdown_timeout: Duration::from_secs(2),
        })
}

#[tokio::test]
async fn controller_follows_simulated_ramp() {
    let sim = RunningSimulator::start(2).await;
    let controller = Arc::new(TemperatureController::new(controller_settings(sim.addr, 2)).unwrap());
    let backend = backend_for(controller.clone());

    backend.initialise().await.unwrap();
    backend.connect().await.unwrap();
    assert_eq!(backend.state(), LifecycleState::Running);
    assert!(controller.connection().is_connected());

    // Polled registers pick up the device's power-on state
    controller
        .ramp_rate()
        .wait_for_value(|v| *v == Value::Float(1.0), WAIT)
        .await
        .unwrap();
    let ramp = controller.ramp(1).unwrap();
    ramp.end()
        .wait_for_value(|v| *v == Value::Int(50), WAIT)
        .await
        .unwrap();

    // Writes go through the API by path
    let api = backend.api().unwrap();
    for (path, value) in [
        ("ramp_rate", Value::Float(10.0)),
        ("ramp.1.start", Value::Int(1)),
        ("ramp.1.end", Value::Int(3)),
    ] {
        let response = api
            .dispatch(ApiRequest::Write {
                path: path.to_string(),
                value,
            })
            .await
            .unwrap();
        assert_eq!(response, ApiResponse::Done);
    }
    ramp.end()
        .wait_for_value(|v| *v == Value::Int(3), WAIT)
        .await
        .unwrap();
    assert_eq!(ramp.end().setpoint(), Some(Value::Int(3)));

    ramp.enabled().put(Value::Enum(1), true).await.unwrap();
    ramp.target()
        .wait_for_value(|v| *v == Value::Float(3.0), WAIT)
        .await
        .unwrap();
    // The device switches the ramp off once it arrives
    ramp.enabled()
        .wait_for_value(|v| *v == Value::Enum(0), WAIT)
        .await
        .unwrap();

    let read = api
        .dispatch(ApiRequest::Read {
            path: "ramp.1.target".into(),
        })
        .await
        .unwrap();
    assert_eq!(read, ApiResponse::Value(Value::Float(3.0)));

    backend.shutdown().await.unwrap();
    assert_eq!(backend.state(), LifecycleState::Stopped);
    assert!(!controller.connection().is_connected());
    sim.stop().await;
}

#[tokio::test]
async fn cancel_all_stops_running_ramps() {
    let sim = RunningSimulator::start(2).await;
    let controller = Arc::new(TemperatureController::new(controller_settings(sim.addr, 2)).unwrap());
    let backend = backend_for(controller.clone());
    backend.initialise().await.unwrap();
    backend.connect().await.unwrap();

    let api = backend.api().unwrap();
    for index in 1..=2 {
        api.dispatch(ApiRequest::Write {
            path: format!("ramp.{index}.enabled"),
            value: Value::Enum(1),
        })
        .await
        .unwrap();
    }
    let second = controller.ramp(2).unwrap();
    second
        .enabled()
        .wait_for_value(|v| *v == Value::Enum(1), WAIT)
        .await
        .unwrap();

    // Voltages come from the scan, not from register polling
    second
        .voltage()
        .wait_for_value(|v| v.as_float().is_some_and(|x| x != 0.0), WAIT)
        .await
        .unwrap();

    api.dispatch(ApiRequest::Command {
        path: "cancel_all".into(),
    })
    .await
    .unwrap();

    for index in 1..=2 {
        controller
            .ramp(index)
            .unwrap()
            .enabled()
            .wait_for_value(|v| *v == Value::Enum(0), WAIT)
            .await
            .unwrap();
    }
    {
        let device = sim.device.lock();
        assert_eq!(device.is_enabled(0), Some(false));
        assert_eq!(device.is_enabled(1), Some(false));
    }

    backend.shutdown().await.unwrap();
    sim.stop().await;
}

#[tokio::test]
async fn unreachable_device_fails_connect() {
    // Reserve a port, then free it so nothing is listening
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let controller = Arc::new(TemperatureController::new(controller_settings(addr, 1)).unwrap());
    let backend = backend_for(controller.clone());

    let err = backend.run().await.unwrap_err();
    assert!(
        matches!(&err, FastCsError::ConnectionEstablishment { controller, .. } if controller == "<root>"),
        "unexpected error: {err}"
    );
    assert_eq!(backend.task_count(), 0);
    assert_eq!(backend.state(), LifecycleState::Stopped);
}
