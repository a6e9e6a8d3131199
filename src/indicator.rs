//! Status LED on a single output pin

use crate::config;
use crate::platform::{Clock, OutputPin};

/// On/off indicator light.
///
/// Pin errors are ignored; the light is best-effort feedback.
pub struct Indicator<P> {
    pin: P,
    lit: bool,
    active_low: bool,
}

impl<P: OutputPin> Indicator<P> {
    /// Create an indicator and switch it off.
    pub fn new(pin: P, active_low: bool) -> Self {
        let mut indicator = Self {
            pin,
            lit: true,
            active_low,
        };
        indicator.off();
        indicator
    }

    pub fn on(&mut self) {
        self.drive(true);
    }

    pub fn off(&mut self) {
        self.drive(false);
    }

    pub fn flip(&mut self) {
        self.drive(!self.lit);
    }

    pub fn is_lit(&self) -> bool {
        self.lit
    }

    fn drive(&mut self, lit: bool) {
        let _ = if lit == self.active_low {
            self.pin.set_low()
        } else {
            self.pin.set_high()
        };
        self.lit = lit;
    }

    /// Flash a number in decimal, most significant digit first.
    ///
    /// Each digit is shown as that many flashes followed by a gap, so `12`
    /// is one flash, a gap, two flashes, a gap. Zero digits are just a gap.
    pub async fn flash_code<C: Clock>(&mut self, clock: &C, code: u32) {
        let mut power = 1;
        while code / power >= 10 {
            power *= 10;
        }

        loop {
            let digit = (code / power) % 10;
            for _ in 0..digit {
                self.on();
                clock.delay_ms(config::DIGIT_FLASH_INTERVAL_MS).await;
                self.off();
                clock.delay_ms(config::DIGIT_FLASH_INTERVAL_MS).await;
            }
            clock.delay_ms(config::DIGIT_GAP_MS).await;

            if power == 1 {
                break;
            }
            power /= 10;
        }
    }
}
