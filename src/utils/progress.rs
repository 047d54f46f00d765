use std::time::{Duration, Instant};

/// 速度计算器 - 使用环形缓冲区
pub struct SpeedCalculator {
    /// 采样的时间跟字节
    samples: Vec<(Instant, u64)>,

    /// 最大采样
    max_samples: usize,

    /// 下一个要写入的位置
    current_index: usize,

    /// 累计传输的字节数，用于计算平均速度
    total_bytes: u64,

    /// 开始时间
    start_time: Instant,
}

impl SpeedCalculator {
    pub fn new(max_samples: usize) -> Self {
        let max_samples = max_samples.max(2);

        Self {
            max_samples,
            samples: Vec::with_capacity(max_samples),
            current_index: 0,
            total_bytes: 0,
            start_time: Instant::now(),
        }
    }

    pub fn add_sample(&mut self, bytes: u64) {
        let now = Instant::now();
        self.total_bytes += bytes;

        if self.samples.len() < self.max_samples {
            self.samples.push((now, bytes));
        } else {
            // 缓冲区已满，覆盖最老的样本
            self.samples[self.current_index] = (now, bytes);
            self.current_index = (self.current_index + 1) % self.max_samples;
        }
    }

    /// 按时间顺序排列的样本
    fn ordered_samples(&self) -> Vec<(Instant, u64)> {
        if self.samples.len() < self.max_samples {
            return self.samples.clone();
        }

        let (newer, older) = self.samples.split_at(self.current_index);
        older.iter().chain(newer.iter()).copied().collect()
    }

    /// 瞬时速度，基于最近 25% 的样本（至少 2 个）
    pub fn instant_speed(&self) -> f64 {
        let samples = self.ordered_samples();
        if samples.len() < 2 {
            return 0.0;
        }

        let recent_count = (samples.len() / 4).max(2);
        let recent = &samples[samples.len() - recent_count..];

        // 第一个样本的字节在时间窗口开始之前就已经传完
        let bytes: u64 = recent.iter().skip(1).map(|(_, b)| b).sum();
        let duration = recent[recent.len() - 1]
            .0
            .duration_since(recent[0].0)
            .as_secs_f64();

        if duration > 0.0 {
            bytes as f64 / duration
        } else {
            0.0
        }
    }

    /// 平均速度
    pub fn average_speed(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_bytes as f64 / elapsed
        } else {
            0.0
        }
    }

    /// 估算剩余时间，优先使用瞬时速度
    pub fn estimate_eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = match self.instant_speed() {
            speed if speed > 0.0 => speed,
            _ => self.average_speed(),
        };

        if speed > 0.0 {
            Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.current_index = 0;
        self.total_bytes = 0;
        self.start_time = Instant::now();
    }
}

/// 格式化字节数
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const UNIT_SIZE: f64 = 1024.0;

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= UNIT_SIZE && unit_index < UNITS.len() - 1 {
        size /= UNIT_SIZE;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// 格式化速度
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second as u64))
}

/// 格式化持续时间
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
