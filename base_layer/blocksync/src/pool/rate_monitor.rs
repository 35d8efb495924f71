//  Copyright 2024, The Tari Project
//
//  Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
//  following conditions are met:
//
//  1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
//  disclaimer.
//
//  2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
//  following disclaimer in the documentation and/or other materials provided with the distribution.
//
//  3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
//  products derived from this software without specific prior written permission.
//
//  THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
//  INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
//  DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
//  SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
//  SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
//  WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
//  USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::time::Duration;

use tokio::time::Instant;

/// Receive-rate estimate in bytes per second.
///
/// Bytes are accumulated into samples of at least `sample_period`. Each completed sample is folded into an
/// exponential moving average whose weight decays with the sample's length relative to `window`, so a long idle
/// gap counts as one long, empty sample.
#[derive(Debug, Clone)]
pub struct RateMonitor {
    sample_period: Duration,
    window: Duration,
    sample_start: Instant,
    sample_bytes: u64,
    rema: f64,
    num_samples: u64,
}

impl RateMonitor {
    pub fn new(sample_period: Duration, window: Duration) -> Self {
        Self {
            sample_period,
            window,
            sample_start: Instant::now(),
            sample_bytes: 0,
            rema: 0.0,
            num_samples: 0,
        }
    }

    /// Seeds the moving average. The next sample is blended into this value rather than replacing it.
    pub fn set_rema(&mut self, rate: f64) {
        self.rema = rate;
        self.num_samples = self.num_samples.max(1);
    }

    pub fn update(&mut self, num_bytes: usize) {
        self.roll(Instant::now());
        self.sample_bytes += num_bytes as u64;
    }

    pub fn current_transfer_rate(&mut self) -> u64 {
        self.roll(Instant::now());
        self.rema.round() as u64
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.sample_start);
        if elapsed < self.sample_period || elapsed.is_zero() {
            return;
        }
        let secs = elapsed.as_secs_f64();
        let sample_rate = self.sample_bytes as f64 / secs;
        if self.num_samples > 0 {
            let weight = (-secs / self.window.as_secs_f64()).exp();
            self.rema = sample_rate + weight * (self.rema - sample_rate);
        } else {
            self.rema = sample_rate;
        }
        self.num_samples += 1;
        self.sample_start = now;
        self.sample_bytes = 0;
    }
}
