use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::Semaphore;
use tracing::trace;

use crate::util::safe_converter::SafeCast;

/// A counting admission gate for inbound messages, limiting either the number of messages or
///  the number of payload bytes that are received but not yet handed to dispatch. A throttle is
///  typically shared by all connections of a policy class.
///
/// Acquiring blocks until enough budget is available, releasing never blocks. Requests larger
///  than the throttle's maximum are clamped to the maximum, so a single huge message can still
///  pass once the throttle is otherwise unused.
pub struct Throttle {
    name: String,
    max: u32,
    semaphore: Semaphore,
}

impl Debug for Throttle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Throttle({}: {}/{})", self.name, self.available(), self.max)
    }
}

impl Throttle {
    pub fn new(name: impl Into<String>, max: u32) -> Throttle {
        assert!(max > 0, "a throttle needs a positive maximum");
        Throttle {
            name: name.into(),
            max,
            semaphore: Semaphore::new(max.safe_cast()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// the amount that is actually taken for a request of `n`
    pub fn clamped(&self, n: u64) -> u32 {
        if n > self.max as u64 {
            self.max
        }
        else {
            n as u32
        }
    }

    /// Blocks until the (clamped) amount is available and takes it. Returns the amount that was
    ///  taken, which is what must be passed to [Throttle::release] later.
    pub async fn acquire(&self, n: u64) -> anyhow::Result<u32> {
        let amount = self.clamped(n);
        if amount == 0 {
            return Ok(0);
        }
        trace!("throttle {}: acquiring {}", self.name, amount);
        self.semaphore.acquire_many(amount).await
            .map_err(|_| anyhow!("throttle {} was closed", self.name))?
            .forget();
        Ok(amount)
    }

    /// like [Throttle::acquire], but giving up after `timeout` if it is set
    pub async fn acquire_with_timeout(&self, n: u64, timeout: Option<Duration>) -> anyhow::Result<u32> {
        match timeout {
            None => self.acquire(n).await,
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.acquire(n)).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("timeout acquiring {} from throttle {}", self.clamped(n), self.name)),
                }
            }
        }
    }

    pub fn release(&self, amount: u32) {
        if amount > 0 {
            trace!("throttle {}: releasing {}", self.name, amount);
            self.semaphore.add_permits(amount.safe_cast());
        }
    }
}


/// The throttle budget held by one inbound message between admission and dispatch. Everything
///  held is returned on [Admission::release], or when the admission is dropped because the
///  message was aborted half way.
#[derive(Default)]
pub struct Admission {
    held: Vec<(Arc<Throttle>, u32)>,
}

impl Debug for Admission {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.held.iter().map(|(t, n)| (t.name(), *n)))
            .finish()
    }
}

impl Admission {
    pub fn add(&mut self, throttle: Arc<Throttle>, amount: u32) {
        self.held.push((throttle, amount));
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn release(mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        for (throttle, amount) in self.held.drain(..) {
            throttle.release(amount);
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.release_all();
    }
}
