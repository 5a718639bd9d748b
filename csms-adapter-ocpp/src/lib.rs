//! # CSMS OCPP Adapter
//!
//! OCPP 1.6-J (JSON over WebSocket) front end for the charge-point session core.
//!
//! ## Architecture
//!
//! ```text
//! Charge points / simulators
//!       │ WebSocket, subprotocol ocpp1.6
//!       ▼
//! ┌──────────────────────────────────────┐
//! │    csms-adapter-ocpp                 │
//! │  ┌──────────────┐  ┌──────────────┐  │
//! │  │ CentralSystem│─►│ Protocol     │  │
//! │  │ (listener)   │  │ Engine / conn│  │
//! │  └──────────────┘  └──────┬───────┘  │
//! │         OCPP codec ◄──────┘          │
//! └─────────────┬────────────────────────┘
//!               │ abstract contract
//!               ▼
//! ┌──────────────────────────────────────┐
//! │    csms-core                         │
//! │  Registry │ Model │ Dispatcher       │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## OCPP ↔ Core Mapping
//!
//! | OCPP Action | Core message | Direction |
//! |-------------|--------------|-----------|
//! | BootNotification | `Boot` | CP → CS |
//! | StatusNotification | `StatusReport` | CP → CS |
//! | MeterValues (`Current.Import`) | `MeterValues` | CP → CS |
//! | Heartbeat | `Heartbeat` | CP → CS |
//! | StartTransaction / StopTransaction | `TransactionStarted` / `TransactionStopped` | CP → CS |
//! | RemoteStartTransaction (TxProfile) | `RemoteStart` | CS → CP |
//! | RemoteStopTransaction | `RemoteStop` | CS → CP |
//! | SetChargingProfile (TxDefaultProfile, A) | `SetCurrent` | CS → CP |
//! | Reset (Soft) | `ClearFault` | CS → CP |
//!
//! ## Usage
//!
//! ```no_run
//! use csms_adapter_ocpp::{CentralSystem, CentralSystemConfig};
//! use csms_core::Command;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CentralSystemConfig::new("127.0.0.1:9000".parse()?);
//!     let csms = CentralSystem::start(config).await?;
//!
//!     // ... charge points connect to ws://127.0.0.1:9000/ocpp/<identity>
//!     let confirmation = csms.submit("CP001", Command::SetCurrent { amps: 6.0 }).await?;
//!     println!("{:?}", confirmation);
//!
//!     csms.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod ocpp;
pub mod config;
pub mod engine;
pub mod server;
pub mod simulator;

pub use config::{CentralSystemConfig, EngineConfig, SimulatorConfig, OCPP_SUBPROTOCOL};
pub use engine::{EngineExit, EngineHandle, ProtocolEngine};
pub use server::{identity_from_path, CentralSystem, ServerError};
pub use simulator::{ChargePointSimulator, SimulatorError, SimulatorHandle};

// Re-export key types
pub use ocpp::{Action, Call, CallError, CallResult, ChargePointErrorCode, ErrorCode, OcppError, OcppMessage};
