//! Six-gauge force/torque stage fed by the U3 and an auxiliary ADC.
//!
//! Gauges SG2-SG5 come from the U3 stream, SG0-SG1 from a second converter.
//! The matrix that turns gauge voltages into forces lives behind
//! [`CalibrationEngine`].

use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

pub const NUM_GAUGES: usize = 6;

/// Forces (Fx, Fy, Fz) followed by torques (Tx, Ty, Tz).
pub type Wrench = [f64; 6];

const BRIDGE_OFFSET: usize = 2;
const BRIDGE_GAUGES: usize = 4;
const AUX_GAUGES: usize = 2;

/// Auxiliary readings beyond this magnitude are clipped by the converter.
pub const AUX_SATURATION_VOLTS: f64 = 6.0;

/// Converts gauge voltages into a wrench.
pub trait CalibrationEngine: Sized {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Loads a sensor calibration file.
    fn load(path: &Path) -> Result<Self, Self::Error>;

    fn set_bias(&mut self, voltages: &[f64; NUM_GAUGES]) -> Result<(), Self::Error>;

    fn convert(&self, voltages: &[f64; NUM_GAUGES]) -> Result<Wrench, Self::Error>;
}

#[derive(Error, Debug)]
pub enum ForceTorqueError<E> {
    #[error("expected {expected} gauge voltages, got {actual}")]
    WrongGaugeCount { expected: usize, actual: usize },

    #[error("auxiliary ADC saturated: {0:?}")]
    Saturated([f64; AUX_GAUGES]),

    #[error("no bias captured yet")]
    NotBiased,

    #[error("calibration engine: {0}")]
    Engine(#[source] E),
}

pub struct ForceTorqueStage<E: CalibrationEngine> {
    engine: E,
    gauges: [f64; NUM_GAUGES],
    biased: bool,
}

impl<E: CalibrationEngine> ForceTorqueStage<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            gauges: [0.0; NUM_GAUGES],
            biased: false,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ForceTorqueError<E::Error>> {
        let engine = E::load(path).map_err(ForceTorqueError::Engine)?;
        info!(path = %path.display(), "Loaded force/torque calibration");
        Ok(Self::new(engine))
    }

    pub fn gauges(&self) -> &[f64; NUM_GAUGES] {
        &self.gauges
    }

    pub fn is_biased(&self) -> bool {
        self.biased
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Takes SG2-SG5 from one U3 scan.
    pub fn update_bridge(&mut self, voltages: &[f64]) -> Result<(), ForceTorqueError<E::Error>> {
        if voltages.len() != BRIDGE_GAUGES {
            return Err(ForceTorqueError::WrongGaugeCount {
                expected: BRIDGE_GAUGES,
                actual: voltages.len(),
            });
        }
        self.gauges[BRIDGE_OFFSET..BRIDGE_OFFSET + BRIDGE_GAUGES].copy_from_slice(voltages);
        Ok(())
    }

    /// Takes SG0-SG1. A saturated reading leaves the previous values in place.
    pub fn update_aux(&mut self, voltages: &[f64]) -> Result<(), ForceTorqueError<E::Error>> {
        let aux: [f64; AUX_GAUGES] = voltages.try_into().map_err(|_| ForceTorqueError::WrongGaugeCount {
            expected: AUX_GAUGES,
            actual: voltages.len(),
        })?;
        if aux.iter().any(|v| v.abs() > AUX_SATURATION_VOLTS) {
            debug!(?aux, "Rejecting saturated auxiliary reading");
            return Err(ForceTorqueError::Saturated(aux));
        }
        self.gauges[..AUX_GAUGES].copy_from_slice(&aux);
        Ok(())
    }

    /// Uses the current gauge vector as the zero point.
    pub fn set_bias(&mut self) -> Result<(), ForceTorqueError<E::Error>> {
        self.engine.set_bias(&self.gauges).map_err(ForceTorqueError::Engine)?;
        self.biased = true;
        info!(gauges = ?self.gauges, "Bias captured");
        Ok(())
    }

    pub fn measure(&self) -> Result<Wrench, ForceTorqueError<E::Error>> {
        if !self.biased {
            return Err(ForceTorqueError::NotBiased);
        }
        self.engine.convert(&self.gauges).map_err(ForceTorqueError::Engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Wrench = gauge voltage minus bias, repeated into both halves.
    struct Offsetting {
        bias: [f64; NUM_GAUGES],
    }

    impl CalibrationEngine for Offsetting {
        type Error = io::Error;

        fn load(path: &Path) -> Result<Self, io::Error> {
            if path.as_os_str().is_empty() {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no calibration file"));
            }
            Ok(Self { bias: [0.0; NUM_GAUGES] })
        }

        fn set_bias(&mut self, voltages: &[f64; NUM_GAUGES]) -> Result<(), io::Error> {
            self.bias = *voltages;
            Ok(())
        }

        fn convert(&self, voltages: &[f64; NUM_GAUGES]) -> Result<Wrench, io::Error> {
            let mut wrench = [0.0; 6];
            for (i, w) in wrench.iter_mut().enumerate() {
                *w = voltages[i] - self.bias[i];
            }
            Ok(wrench)
        }
    }

    fn stage() -> ForceTorqueStage<Offsetting> {
        ForceTorqueStage::load(Path::new("sensor.cal")).unwrap()
    }

    #[test]
    fn test_gauge_layout() {
        let mut stage = stage();
        stage.update_aux(&[0.1, 0.2]).unwrap();
        stage.update_bridge(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(stage.gauges(), &[0.1, 0.2, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_measure_requires_bias() {
        let mut stage = stage();
        assert!(matches!(stage.measure(), Err(ForceTorqueError::NotBiased)));

        stage.update_bridge(&[1.0, 1.0, 1.0, 1.0]).unwrap();
        stage.set_bias().unwrap();
        stage.update_bridge(&[1.5, 1.0, 1.0, 0.5]).unwrap();
        let wrench = stage.measure().unwrap();
        assert_eq!(wrench, [0.0, 0.0, 0.5, 0.0, 0.0, -0.5]);
    }

    #[test]
    fn test_saturated_aux_rejected() {
        let mut stage = stage();
        stage.update_aux(&[1.0, -1.0]).unwrap();
        match stage.update_aux(&[6.5, 0.0]) {
            Err(ForceTorqueError::Saturated(values)) => assert_eq!(values, [6.5, 0.0]),
            other => panic!("expected saturation, got {:?}", other.map(|_| ())),
        }
        assert!(stage.update_aux(&[0.0, -7.5]).is_err());
        assert_eq!(&stage.gauges()[..2], &[1.0, -1.0]);
    }

    #[test]
    fn test_aux_full_scale_accepted() {
        let mut stage = stage();
        stage.update_aux(&[6.0, -6.0]).unwrap();
        assert_eq!(&stage.gauges()[..2], &[6.0, -6.0]);
        assert!(matches!(
            stage.update_aux(&[6.000_001, 0.0]),
            Err(ForceTorqueError::Saturated(_))
        ));
    }

    #[test]
    fn test_wrong_gauge_count() {
        let mut stage = stage();
        assert!(matches!(
            stage.update_bridge(&[1.0, 2.0]),
            Err(ForceTorqueError::WrongGaugeCount { expected: 4, actual: 2 })
        ));
        assert!(matches!(
            stage.update_aux(&[1.0]),
            Err(ForceTorqueError::WrongGaugeCount { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_load_failure_surfaces_engine_error() {
        let result = ForceTorqueStage::<Offsetting>::load(Path::new(""));
        assert!(matches!(result, Err(ForceTorqueError::Engine(_))));
    }
}
