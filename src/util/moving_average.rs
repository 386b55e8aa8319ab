/// Number of inbound-packet samples a peer's bandwidth estimate is averaged
///  over.
pub const BANDWIDTH_WINDOW: usize = 100;

/// A fixed-size window of (timestamp, byte count) samples for estimating a
///  peer's inbound packet and data rates. The buffer grows until the window
///  is full, then becomes a ring that evicts the oldest sample.
pub struct SampleWindow<const N: usize> {
    buf: BufferImpl<N>,
    cached_bytes: u64,
}

impl<const N: usize> SampleWindow<N> {
    pub fn new() -> SampleWindow<N> {
        SampleWindow {
            buf: BufferImpl::new(),
            cached_bytes: 0,
        }
    }

    pub fn record(&mut self, timestamp_micros: u64, bytes: u64) {
        if let Some((_, evicted_bytes)) = self.buf.add_sample((timestamp_micros, bytes)) {
            self.cached_bytes -= evicted_bytes;
        }
        self.cached_bytes += bytes;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }

    /// packets per second over the window, measured against 'now'
    pub fn events_per_second(&self, now_micros: u64) -> f64 {
        match self.span_seconds(now_micros) {
            Some(span) => self.buf.len() as f64 / span,
            None => 0.0,
        }
    }

    /// kilobits per second over the window, measured against 'now'
    pub fn kilobits_per_second(&self, now_micros: u64) -> f64 {
        match self.span_seconds(now_micros) {
            Some(span) => (self.cached_bytes * 8) as f64 / 1000.0 / span,
            None => 0.0,
        }
    }

    fn span_seconds(&self, now_micros: u64) -> Option<f64> {
        let (oldest_micros, _) = self.buf.oldest()?;
        if now_micros <= oldest_micros {
            return None;
        }
        Some((now_micros - oldest_micros) as f64 / 1_000_000.0)
    }
}

enum BufferImpl<const N: usize> {
    Growing(Vec<(u64, u64)>),
    Ring { buf: Vec<(u64, u64)>, next: usize },
}

impl<const N: usize> BufferImpl<N> {
    fn new() -> BufferImpl<N> {
        BufferImpl::Growing(vec![])
    }

    fn len(&self) -> usize {
        match self {
            BufferImpl::Growing(buf) => buf.len(),
            BufferImpl::Ring { buf, .. } => buf.len(),
        }
    }

    fn oldest(&self) -> Option<(u64, u64)> {
        match self {
            BufferImpl::Growing(buf) => buf.first().copied(),
            // 'next' is the overwrite position, i.e. the oldest sample
            BufferImpl::Ring { buf, next } => Some(buf[*next]),
        }
    }

    /// adds a new sample, returning the sample that was evicted in its place (if any)
    #[must_use]
    fn add_sample(&mut self, sample: (u64, u64)) -> Option<(u64, u64)> {
        match self {
            BufferImpl::Growing(buf) => {
                buf.push(sample);
                if buf.len() == N {
                    let buf = std::mem::take(buf);
                    *self = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = buf[*next];
                buf[*next] = sample;
                *next = (*next + 1) % N;
                Some(evicted)
            }
        }
    }
}
