//! Demo temperature controller
//!
//! A multi-channel temperature ramp controller reached over TCP. The device
//! speaks a line protocol where `NAME?` queries a register and `NAME=value`
//! sets it; per-ramp registers carry a two digit suffix (`T01?`, `S02=40`).
//! `V?` returns every ramp voltage as a JSON array.
//!
//! The controller tree is:
//!
//! ```text
//! <root>            ramp_rate (RW), power (R), cancel_all(), voltage scan
//! └── ramp          vector, indices 1..=n
//!     └── <n>       start, end, enabled (RW), target, actual, voltage (R)
//! ```
//!
//! [`simulation`] provides a device to run it against.

pub mod simulation;

use async_trait::async_trait;
use fastcs_core::connection::Connection;
use fastcs_core::{
    Attribute, AttributeIo, AttributeIoRef, Command, Controller, ControllerNode,
    ControllerVector, DataType, EnumSpec, FastCsError, IpConnection, IpConnectionSettings, Result,
    Scan, UpdatePeriod, Value,
};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ControllerSettings;

/// Default polling period of device registers.
pub const DEFAULT_UPDATE_PERIOD: Duration = Duration::from_millis(200);

/// Period of the ramp voltage scan.
pub const VOLTAGE_SCAN_PERIOD: Duration = Duration::from_millis(100);

/// Name of the ramp controller vector under the root.
pub const RAMP_VECTOR: &str = "ramp";

#[derive(Debug, Clone)]
pub struct TemperatureControllerSettings {
    pub num_ramp_controllers: usize,
    pub ip_settings: IpConnectionSettings,
}

impl From<&ControllerSettings> for TemperatureControllerSettings {
    fn from(settings: &ControllerSettings) -> Self {
        Self {
            num_ramp_controllers: settings.num_ramp_controllers,
            ip_settings: settings.ip_settings(),
        }
    }
}

// =============================================================================
// Attribute IO
// =============================================================================

/// Register name of a device value.
#[derive(Debug, Clone)]
pub struct TemperatureControllerIoRef {
    pub name: String,
    /// Polling period, `None` for manual refresh. Checked when the backend
    /// initialises.
    pub update_period: Option<Duration>,
}

impl TemperatureControllerIoRef {
    /// Register polled every [`DEFAULT_UPDATE_PERIOD`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            update_period: Some(DEFAULT_UPDATE_PERIOD),
        }
    }

    pub fn with_update_period(mut self, period: Option<Duration>) -> Self {
        self.update_period = period;
        self
    }
}

impl AttributeIoRef for TemperatureControllerIoRef {
    fn update_period(&self) -> Result<Option<UpdatePeriod>> {
        self.update_period.map(UpdatePeriod::every).transpose()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Reads and writes `{name}{suffix}` registers over a shared connection.
pub struct TemperatureControllerIo {
    connection: Arc<dyn Connection>,
    suffix: String,
}

impl TemperatureControllerIo {
    pub fn new(connection: Arc<dyn Connection>, suffix: impl Into<String>) -> Self {
        Self {
            connection,
            suffix: suffix.into(),
        }
    }

    fn register(&self, io_ref: &TemperatureControllerIoRef) -> String {
        format!("{}{}", io_ref.name, self.suffix)
    }
}

#[async_trait]
impl AttributeIo for TemperatureControllerIo {
    type Ref = TemperatureControllerIoRef;

    async fn update(&self, attr: &Attribute, io_ref: &TemperatureControllerIoRef) -> Result<()> {
        let response = self
            .connection
            .send_query(&format!("{}?\r\n", self.register(io_ref)))
            .await?;
        attr.update(attr.datatype().parse_wire(&response)?)
    }

    async fn send(
        &self,
        attr: &Attribute,
        io_ref: &TemperatureControllerIoRef,
        value: Value,
    ) -> Result<()> {
        let text = attr.datatype().format_wire(&value)?;
        self.connection
            .send_command(&format!("{}={}\r\n", self.register(io_ref), text))
            .await
    }
}

/// `Off` / `On` as the device encodes them.
pub fn on_off() -> Result<DataType> {
    Ok(DataType::Enum(EnumSpec::new([("Off", "0"), ("On", "1")])?))
}

// =============================================================================
// Ramp controller
// =============================================================================

/// One temperature ramp channel.
pub struct TemperatureRampController {
    node: ControllerNode,
    index: usize,
    start: Attribute,
    end: Attribute,
    enabled: Attribute,
    target: Attribute,
    actual: Attribute,
    voltage: Attribute,
}

impl TemperatureRampController {
    /// Channel `index` (1-based) talking through `connection`.
    pub fn new(index: usize, connection: Arc<dyn Connection>) -> Result<Self> {
        let suffix = format!("{index:02}");
        let node = ControllerNode::new().with_description(format!("Ramp{suffix}"));
        node.add_io(TemperatureControllerIo::new(connection, suffix))?;

        let start = Attribute::read_write(DataType::int())
            .io_ref(TemperatureControllerIoRef::new("S"))
            .description("Ramp start temperature")
            .build();
        let end = Attribute::read_write(DataType::int())
            .io_ref(TemperatureControllerIoRef::new("E"))
            .description("Ramp end temperature")
            .build();
        let enabled = Attribute::read_write(on_off()?)
            .io_ref(TemperatureControllerIoRef::new("N"))
            .build();
        let target = Attribute::read(DataType::float_with_prec(3))
            .io_ref(TemperatureControllerIoRef::new("T"))
            .group("Readback")
            .build();
        let actual = Attribute::read(DataType::float_with_prec(3))
            .io_ref(TemperatureControllerIoRef::new("A"))
            .group("Readback")
            .build();
        // Filled in by the parent's voltage scan
        let voltage = Attribute::read(DataType::float_with_prec(3))
            .group("Readback")
            .build();

        node.add_attribute("start", start.clone())?;
        node.add_attribute("end", end.clone())?;
        node.add_attribute("enabled", enabled.clone())?;
        node.add_attribute("target", target.clone())?;
        node.add_attribute("actual", actual.clone())?;
        node.add_attribute("voltage", voltage.clone())?;

        Ok(Self {
            node,
            index,
            start,
            end,
            enabled,
            target,
            actual,
            voltage,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn start(&self) -> &Attribute {
        &self.start
    }

    pub fn end(&self) -> &Attribute {
        &self.end
    }

    pub fn enabled(&self) -> &Attribute {
        &self.enabled
    }

    pub fn target(&self) -> &Attribute {
        &self.target
    }

    pub fn actual(&self) -> &Attribute {
        &self.actual
    }

    pub fn voltage(&self) -> &Attribute {
        &self.voltage
    }
}

#[async_trait]
impl Controller for TemperatureRampController {
    fn node(&self) -> &ControllerNode {
        &self.node
    }
}

// =============================================================================
// Temperature controller
// =============================================================================

/// Root controller of the demo device.
pub struct TemperatureController {
    node: ControllerNode,
    connection: Arc<IpConnection>,
    ramp_rate: Attribute,
    power: Attribute,
    ramps: Arc<ControllerVector<TemperatureRampController>>,
}

impl TemperatureController {
    pub fn new(settings: TemperatureControllerSettings) -> Result<Self> {
        if settings.num_ramp_controllers == 0 {
            return Err(FastCsError::Configuration(
                "temperature controller needs at least one ramp".into(),
            ));
        }

        let connection = Arc::new(IpConnection::new(settings.ip_settings));
        let shared: Arc<dyn Connection> = connection.clone();

        let node = ControllerNode::new().with_description("Temperature ramp controller");
        node.add_io(TemperatureControllerIo::new(shared.clone(), ""))?;

        let ramp_rate = Attribute::read_write(DataType::float())
            .io_ref(TemperatureControllerIoRef::new("R"))
            .description("Ramp rate in degrees per second")
            .build();
        let power = Attribute::read(DataType::float())
            .io_ref(TemperatureControllerIoRef::new("P"))
            .build();
        node.add_attribute("ramp_rate", ramp_rate.clone())?;
        node.add_attribute("power", power.clone())?;

        let ramps = Arc::new(ControllerVector::new().with_description("Ramp channels"));
        for index in 1..=settings.num_ramp_controllers {
            ramps.insert(
                index,
                Arc::new(TemperatureRampController::new(index, shared.clone())?),
            )?;
        }
        node.add_sub_controller(RAMP_VECTOR, ramps.clone())?;

        node.add_command("cancel_all", cancel_all(ramps.clone()))?;
        node.add_scan("update_voltages", update_voltages(shared, ramps.clone())?)?;

        Ok(Self {
            node,
            connection,
            ramp_rate,
            power,
            ramps,
        })
    }

    pub fn connection(&self) -> &Arc<IpConnection> {
        &self.connection
    }

    pub fn ramp_rate(&self) -> &Attribute {
        &self.ramp_rate
    }

    pub fn power(&self) -> &Attribute {
        &self.power
    }

    pub fn ramps(&self) -> &Arc<ControllerVector<TemperatureRampController>> {
        &self.ramps
    }

    /// Ramp channel `index` (1-based).
    pub fn ramp(&self, index: usize) -> Result<Arc<TemperatureRampController>> {
        self.ramps.get(index)
    }
}

#[async_trait]
impl Controller for TemperatureController {
    fn node(&self) -> &ControllerNode {
        &self.node
    }

    async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.connection.close().await
    }
}

/// Disable every ramp.
fn cancel_all(ramps: Arc<ControllerVector<TemperatureRampController>>) -> Command {
    Command::new(move || {
        let ramps = ramps.clone();
        async move {
            for (index, ramp) in ramps.iter() {
                tracing::debug!(ramp = index, "Disabling ramp");
                ramp.enabled().put(Value::Enum(0), true).await?;
            }
            Ok(())
        }
    })
    .with_description("Stop all ramps")
}

/// Poll `V?` and spread the voltages over the ramp channels.
fn update_voltages(
    connection: Arc<dyn Connection>,
    ramps: Arc<ControllerVector<TemperatureRampController>>,
) -> Result<Scan> {
    Scan::new(VOLTAGE_SCAN_PERIOD, move || {
        let connection = connection.clone();
        let ramps = ramps.clone();
        async move {
            let response = connection.send_query("V?\r\n").await?;
            let voltages: Vec<f64> = serde_json::from_str(response.trim())
                .map_err(|_| FastCsError::malformed(&response, "JSON array of voltages"))?;
            if voltages.len() < ramps.len() {
                return Err(FastCsError::DeviceCommunication(format!(
                    "expected {} voltages, got {}",
                    ramps.len(),
                    voltages.len()
                )));
            }
            for ((_, ramp), voltage) in ramps.iter().zip(voltages) {
                ramp.voltage().update(voltage)?;
            }
            Ok(())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastcs_core::mock_device::FakeConnection;
    use fastcs_core::{AccessMode, Backend, DataKind, LifecycleState};

    fn settings(ramps: usize) -> TemperatureControllerSettings {
        TemperatureControllerSettings {
            num_ramp_controllers: ramps,
            ip_settings: IpConnectionSettings::new("127.0.0.1", 1),
        }
    }

    #[test]
    fn tree_has_vector_of_ramps() {
        let controller = TemperatureController::new(settings(3)).unwrap();
        assert_eq!(controller.ramps().indices(), vec![1, 2, 3]);

        let ramp = controller.ramp(2).unwrap();
        assert_eq!(ramp.index(), 2);
        assert_eq!(ramp.target().full_name(), "ramp.2.target");
        assert_eq!(ramp.enabled().datatype().kind(), DataKind::Enum);
        assert_eq!(ramp.voltage().access_mode(), AccessMode::Read);
        assert!(ramp.voltage().io_ref().is_none());
        assert_eq!(controller.ramp_rate().access_mode(), AccessMode::ReadWrite);
        assert!(matches!(controller.ramp(4), Err(FastCsError::NotFound(_))));
    }

    #[test]
    fn register_periods_are_checked_when_read() {
        let polled = TemperatureControllerIoRef::new("T");
        assert_eq!(
            polled.update_period().unwrap().and_then(|p| p.period()),
            Some(DEFAULT_UPDATE_PERIOD)
        );
        let manual = TemperatureControllerIoRef::new("T").with_update_period(None);
        assert_eq!(manual.update_period().unwrap(), None);

        let zero = TemperatureControllerIoRef::new("T").with_update_period(Some(Duration::ZERO));
        assert!(matches!(
            zero.update_period(),
            Err(FastCsError::Configuration(_))
        ));
    }

    #[test]
    fn zero_ramps_rejected() {
        assert!(matches!(
            TemperatureController::new(settings(0)),
            Err(FastCsError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn ramp_registers_carry_index_suffix() {
        let fake = Arc::new(
            FakeConnection::new()
                .with_response("T07?", "12.3456\r\n")
                .with_response("N07?", "1\r\n"),
        );
        let ramp = TemperatureRampController::new(7, fake.clone()).unwrap();

        let backend = Backend::from_current(Arc::new(ramp)).unwrap();
        backend.initialise().await.unwrap();
        let api = backend.api().unwrap();

        let target = api.attribute_at("target").unwrap();
        target.refresh().await.unwrap();
        assert_eq!(target.get(), Value::Float(12.346));

        let enabled = api.attribute_at("enabled").unwrap();
        enabled.refresh().await.unwrap();
        assert_eq!(enabled.get(), Value::Enum(1));

        api.attribute_at("start").unwrap().put(15, true).await.unwrap();
        assert_eq!(fake.sent().last().map(String::as_str), Some("S07=15"));
        assert_eq!(backend.state(), LifecycleState::ApiBuilt);
    }

    #[tokio::test]
    async fn cancel_all_disables_every_ramp() {
        let fake = Arc::new(FakeConnection::new());
        let ramps = Arc::new(ControllerVector::new());
        for index in 1..=2 {
            ramps
                .insert(index, Arc::new(TemperatureRampController::new(index, fake.clone()).unwrap()))
                .unwrap();
        }
        let root = Arc::new(ControllerNode::new());
        root.add_sub_controller(RAMP_VECTOR, ramps.clone()).unwrap();
        let backend = Backend::from_current(root).unwrap();
        backend.initialise().await.unwrap();

        cancel_all(ramps.clone()).call().await.unwrap();
        assert_eq!(fake.sent(), vec!["N01=0", "N02=0"]);
        assert_eq!(
            ramps.get(1).unwrap().enabled().setpoint(),
            Some(Value::Enum(0))
        );
    }

    #[tokio::test]
    async fn voltage_scan_fills_every_ramp() {
        let fake = Arc::new(FakeConnection::new().with_response("V?", "[1.5, 2.25]\r\n"));
        let ramps = Arc::new(ControllerVector::new());
        for index in 1..=2 {
            ramps
                .insert(index, Arc::new(TemperatureRampController::new(index, fake.clone()).unwrap()))
                .unwrap();
        }

        let scan = update_voltages(fake.clone(), ramps.clone()).unwrap();
        scan.call().await.unwrap();
        assert_eq!(ramps.get(1).unwrap().voltage().get(), Value::Float(1.5));
        assert_eq!(ramps.get(2).unwrap().voltage().get(), Value::Float(2.25));

        fake.set_response("V?", "[1.0]\r\n");
        assert!(matches!(
            scan.call().await,
            Err(FastCsError::DeviceCommunication(_))
        ));

        fake.set_response("V?", "nonsense\r\n");
        assert!(matches!(
            scan.call().await,
            Err(FastCsError::DeviceCommunication(_))
        ));
    }
}
