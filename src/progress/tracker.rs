use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use crate::core::UploadProgress;
use crate::utils::SpeedCalculator;

pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// 所有分片都回报之前，百分比最多到这里
const MAX_PENDING_PERCENTAGE: f64 = 99.0;

#[derive(Debug, Default)]
struct TrackerState {
    /// 已经回报给后端的字节数
    reported_bytes: u64,
    /// 已回报的分片号，每个分片只计一次
    reported: HashSet<u32>,
    /// 正在传输的分片已发送的字节
    in_flight: HashMap<u32, u64>,
    /// 上一次给出的百分比
    percentage: f64,
}

/// 进度追踪器
///
/// 百分比在一个会话内单调不减：正在传输的分片按已发送字节计入，重试导致的回退会被忽略；
/// 只有最后一个分片的进度回报之后才会到 100%。
pub struct ProgressTracker {
    total_bytes: u64,
    total_parts: u32,
    state: Mutex<TrackerState>,
    speed_calc: Mutex<SpeedCalculator>,
    last_update: Mutex<Option<Instant>>,
    update_interval: Duration,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64, total_parts: u32) -> Self {
        Self {
            total_bytes,
            total_parts,
            state: Mutex::new(TrackerState::default()),
            speed_calc: Mutex::new(SpeedCalculator::new(20)),
            last_update: Mutex::new(None),
            update_interval: Duration::from_millis(500),
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_parts(&self) -> u32 {
        self.total_parts
    }

    /// 开始（或重新开始）传输一个分片
    pub fn begin_part(self: &Arc<Self>, part_number: u32) -> PartProgress {
        self.state.lock().in_flight.insert(part_number, 0);

        PartProgress {
            tracker: self.clone(),
            part_number,
        }
    }

    /// 分片传输失败，丢弃它已计入的字节
    pub fn abandon_part(&self, part_number: u32) {
        self.state.lock().in_flight.remove(&part_number);
    }

    /// 放弃所有正在传输的分片
    pub fn abandon_in_flight(&self) {
        self.state.lock().in_flight.clear();
    }

    fn record_bytes(&self, part_number: u32, bytes: u64) {
        {
            let mut state = self.state.lock();
            match state.in_flight.get_mut(&part_number) {
                Some(sent) => *sent += bytes,
                // 已回报或已放弃的分片
                None => return,
            }
        }
        self.speed_calc.lock().add_sample(bytes);

        let now = Instant::now();
        {
            let mut last_update = self.last_update.lock();
            if let Some(last) = *last_update {
                if now.duration_since(last) < self.update_interval {
                    return;
                }
            }
            *last_update = Some(now);
        }

        self.notify(self.snapshot());
    }

    /// 回报前已确认的字节数加上本分片大小
    pub fn bytes_after(&self, part_size: u64) -> u64 {
        (self.state.lock().reported_bytes + part_size).min(self.total_bytes)
    }

    /// 分片的进度已经回报给后端
    pub fn part_reported(&self, part_number: u32, part_size: u64) -> UploadProgress {
        {
            let mut state = self.state.lock();
            state.in_flight.remove(&part_number);
            if state.reported.insert(part_number) {
                state.reported_bytes = (state.reported_bytes + part_size).min(self.total_bytes);
            }
        }

        let progress = self.snapshot();
        *self.last_update.lock() = Some(Instant::now());
        self.notify(progress.clone());
        progress
    }

    /// 取消时清零
    pub fn reset(&self) {
        *self.state.lock() = TrackerState::default();
        self.speed_calc.lock().reset();
        *self.last_update.lock() = None;
        self.notify(self.snapshot());
    }

    pub fn percentage(&self) -> f64 {
        self.state.lock().percentage
    }

    pub fn snapshot(&self) -> UploadProgress {
        let (uploaded_bytes, completed_parts, percentage) = {
            let mut state = self.state.lock();
            let in_flight: u64 = state.in_flight.values().sum();
            let uploaded = (state.reported_bytes + in_flight).min(self.total_bytes);

            let reported_parts = state.reported.len() as u32;
            let computed = if self.total_parts > 0 && reported_parts >= self.total_parts {
                100.0
            } else if self.total_bytes > 0 {
                (uploaded as f64 * 100.0 / self.total_bytes as f64).min(MAX_PENDING_PERCENTAGE)
            } else {
                0.0
            };

            state.percentage = state.percentage.max(computed);
            (uploaded, reported_parts, state.percentage)
        };

        let speed_calc = self.speed_calc.lock();
        let remaining = self.total_bytes.saturating_sub(uploaded_bytes);

        UploadProgress {
            uploaded_bytes,
            total_bytes: self.total_bytes,
            completed_parts,
            total_parts: self.total_parts,
            percentage,
            speed: speed_calc.instant_speed(),
            average_speed: speed_calc.average_speed(),
            eta: if remaining == 0 { None } else { speed_calc.estimate_eta(remaining) },
        }
    }

    fn notify(&self, progress: UploadProgress) {
        if let Some(ref callback) = self.callback {
            callback(progress);
        }
    }
}

/// 单个分片的进度句柄，由传输层按发送字节推进
#[derive(Clone)]
pub struct PartProgress {
    tracker: Arc<ProgressTracker>,
    part_number: u32,
}

impl PartProgress {
    pub fn part_number(&self) -> u32 {
        self.part_number
    }

    pub fn advance(&self, bytes: u64) {
        if bytes > 0 {
            self.tracker.record_bytes(self.part_number, bytes);
        }
    }
}

impl std::fmt::Debug for PartProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartProgress")
            .field("part_number", &self.part_number)
            .finish()
    }
}
