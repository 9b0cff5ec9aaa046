use core::time::Duration;

/// Client-side timeouts. Each is a bound on one phase of the exchange;
/// `request` bounds the whole exchange from the first byte written to the
/// last body byte read.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutConfig {
    pub resolve: Duration,
    pub connect: Duration,
    pub request: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutConfig {
    pub const fn new() -> Self {
        Self {
            resolve: Duration::from_secs(5),
            connect: Duration::from_secs(10),
            request: Duration::from_secs(20),
        }
    }

    pub fn resolve_timeout(mut self, dur: Duration) -> Self {
        self.resolve = dur;
        self
    }

    pub fn connect_timeout(mut self, dur: Duration) -> Self {
        self.connect = dur;
        self
    }

    pub fn request_timeout(mut self, dur: Duration) -> Self {
        self.request = dur;
        self
    }
}
