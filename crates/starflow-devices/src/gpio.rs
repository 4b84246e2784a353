/*!
 * Raspberry Pi GPIO backend for relays and limit switches.
 */
use std::collections::HashMap;

use rppal::gpio::{Gpio, InputPin, OutputPin};
use tracing::debug;

use crate::error::{DeviceError, Result};
use crate::hardware::{DigitalInput, DigitalOutput, Line};

fn gpio_error(err: rppal::gpio::Error) -> DeviceError {
    DeviceError::transport(format!("GPIO error: {}", err))
}

/// Relay outputs and pulled-up limit switch inputs on the Pi header
#[derive(Debug)]
pub struct GpioIo {
    outputs: HashMap<Line, OutputPin>,
    inputs: HashMap<Line, InputPin>,
    active_low_inputs: bool,
}

impl GpioIo {
    /// Claim `outputs` (driven low) and `inputs` (with pull-ups)
    ///
    /// With `active_low_inputs`, a switch that shorts its line to ground
    /// reads as active.
    pub fn new(outputs: &[Line], inputs: &[Line], active_low_inputs: bool) -> Result<Self> {
        let gpio = Gpio::new().map_err(gpio_error)?;

        let mut output_pins = HashMap::new();
        for &line in outputs {
            let mut pin = gpio.get(line).map_err(gpio_error)?.into_output_low();
            pin.set_reset_on_drop(true);
            output_pins.insert(line, pin);
        }

        let mut input_pins = HashMap::new();
        for &line in inputs {
            input_pins.insert(line, gpio.get(line).map_err(gpio_error)?.into_input_pullup());
        }

        debug!(outputs = ?outputs, inputs = ?inputs, "GPIO lines claimed");
        Ok(Self {
            outputs: output_pins,
            inputs: input_pins,
            active_low_inputs,
        })
    }

    fn output_pin(&mut self, line: Line) -> Result<&mut OutputPin> {
        self.outputs
            .get_mut(&line)
            .ok_or_else(|| DeviceError::configuration(format!("GPIO {} is not an output", line)))
    }
}

impl DigitalOutput for GpioIo {
    fn assert(&mut self, line: Line) -> Result<()> {
        self.output_pin(line)?.set_high();
        Ok(())
    }

    fn deassert(&mut self, line: Line) -> Result<()> {
        self.output_pin(line)?.set_low();
        Ok(())
    }
}

impl DigitalInput for GpioIo {
    fn read(&self, line: Line) -> Result<bool> {
        let pin = self
            .inputs
            .get(&line)
            .ok_or_else(|| DeviceError::configuration(format!("GPIO {} is not an input", line)))?;
        Ok(pin.is_high() != self.active_low_inputs)
    }
}
