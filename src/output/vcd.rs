//! Value-change-dump writer.
//!
//! Logic data and each analog channel's data arrive in separate datafeed
//! packets at independent times, yet VCD output must be ordered by sample
//! number. Every channel tracks the last sample number it has delivered;
//! a merge queue buffers value-change text per sample number and releases
//! an entry only once every enabled channel's counter has advanced past
//! it, which makes the emitted timestamps strictly increasing.
//!
//! Two channel configurations can never produce conflicting arrival
//! order — all-logic, and exactly one analog channel with no logic — and
//! skip the queue entirely ("immediate write").
//!
//! Queue entries live in a slab indexed by position, threaded into a
//! sample-number-ordered list with a free list for recycling and a cached
//! cursor for the near-sequential hot path.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Write;

use crate::channel::ChannelType;
use crate::config::ConfigKey;
use crate::datafeed::{FeedPacket, Packet};
use crate::device::DeviceInfo;
use crate::error::{HalError, HalResult};
use crate::session::DatafeedSink;

// ============================================================================
// Identifiers
// ============================================================================

/// Number of channels the identifier space supports.
pub const MAX_IDENTIFIERS: usize = 94 + 26 * 26 + 26 * 26 * 26;

/// Most compact VCD identifier for channel position `idx`: one printable
/// character from `'!'..='~'` for the first 94 channels, then two and
/// three lowercase letters. Positions beyond the three-letter space are a
/// capacity error.
pub fn identifier(idx: usize) -> HalResult<String> {
    if idx < 94 {
        let c = (b'!' + idx as u8) as char;
        return Ok(c.to_string());
    }
    let idx = idx - 94;
    if idx < 26 * 26 {
        let hi = (b'a' + (idx / 26) as u8) as char;
        let lo = (b'a' + (idx % 26) as u8) as char;
        return Ok(format!("{hi}{lo}"));
    }
    let idx = idx - 26 * 26;
    if idx < 26 * 26 * 26 {
        let a = (b'a' + (idx / (26 * 26)) as u8) as char;
        let b = (b'a' + (idx / 26 % 26) as u8) as char;
        let c = (b'a' + (idx % 26) as u8) as char;
        return Ok(format!("{a}{b}{c}"));
    }
    Err(HalError::Capacity(format!(
        "VCD identifier space exhausted at channel {}",
        idx + 94 + 26 * 26
    )))
}

// ============================================================================
// Timescale
// ============================================================================

/// Pick the timescale frequency for a sample rate: the smallest power of
/// ten at or above the rate, then up to two more decades looking for one
/// the rate divides exactly. If none divides, residual imprecision is
/// accepted.
pub fn timescale_freq(samplerate: u64) -> u64 {
    let mut p: u64 = 1;
    while p < samplerate {
        p = p.saturating_mul(10);
    }
    for _ in 0..2 {
        if p % samplerate == 0 {
            break;
        }
        p = p.saturating_mul(10);
    }
    p
}

/// Render a period of `1/freq` seconds as a VCD timescale declaration
/// body ("1 s", "10 us", "100 ps").
pub fn period_string(freq: u64) -> String {
    const UNITS: &[(u64, &str)] = &[
        (1, "s"),
        (1_000, "ms"),
        (1_000_000, "us"),
        (1_000_000_000, "ns"),
        (1_000_000_000_000, "ps"),
        (1_000_000_000_000_000, "fs"),
    ];
    for &(scale, suffix) in UNITS {
        if freq <= scale {
            return format!("{} {suffix}", scale / freq);
        }
    }
    format!("1/{freq} s")
}

/// Human-readable sample rate for the header comment.
pub fn samplerate_string(samplerate: u64) -> String {
    if samplerate >= 1_000_000_000 && samplerate % 1_000_000_000 == 0 {
        format!("{} GHz", samplerate / 1_000_000_000)
    } else if samplerate >= 1_000_000 && samplerate % 1_000_000 == 0 {
        format!("{} MHz", samplerate / 1_000_000)
    } else if samplerate >= 1_000 && samplerate % 1_000 == 0 {
        format!("{} kHz", samplerate / 1_000)
    } else {
        format!("{samplerate} Hz")
    }
}

// ============================================================================
// Merge queue
// ============================================================================

struct QueueItem {
    snum: u64,
    text: String,
    next: Option<usize>,
}

/// Sample-number-ordered queue of pending value-change text.
///
/// Slots are slab indices; popped slots go onto a free list and keep
/// their `String` allocation for reuse. The cursor caches the slot of the
/// most recent lookup so near-sequential access stays O(1).
pub struct MergeQueue {
    slots: Vec<QueueItem>,
    head: Option<usize>,
    cursor: Option<usize>,
    free: Vec<usize>,
    allocated: u64,
    reused: u64,
}

impl Default for MergeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeQueue {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            cursor: None,
            free: Vec::new(),
            allocated: 0,
            reused: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// (slots ever allocated, slots served from the free list)
    pub fn pool_stats(&self) -> (u64, u64) {
        (self.allocated, self.reused)
    }

    /// Find the slot for `snum`, inserting one in order if absent.
    pub fn position(&mut self, snum: u64) -> usize {
        if let Some(c) = self.cursor {
            if self.slots[c].snum == snum {
                return c;
            }
        }

        // Everything before the cursor is smaller than the cursor's
        // sample number, so the cursor is a valid scan start whenever the
        // target lies at or past it; otherwise restart from the head.
        let start = match self.cursor {
            Some(c) if self.slots[c].snum < snum => Some(c),
            _ => self.head,
        };

        let mut lower: Option<usize> = None;
        let mut walk = start;
        while let Some(i) = walk {
            match self.slots[i].snum.cmp(&snum) {
                Ordering::Equal => {
                    self.cursor = Some(i);
                    return i;
                }
                Ordering::Less => {
                    lower = Some(i);
                    walk = self.slots[i].next;
                }
                Ordering::Greater => break,
            }
        }

        let slot = self.take_slot(snum);
        match lower {
            Some(l) => {
                self.slots[slot].next = self.slots[l].next;
                self.slots[l].next = Some(slot);
            }
            None => {
                self.slots[slot].next = self.head;
                self.head = Some(slot);
            }
        }
        self.cursor = Some(slot);
        slot
    }

    /// Append one value-change token, space-separated from any previous
    /// tokens for the same sample number.
    pub fn append_value(&mut self, slot: usize, token: &str) {
        let text = &mut self.slots[slot].text;
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(token);
    }

    /// Pop the frontmost entry if its sample number is strictly below
    /// `min`. The slot is recycled; its text is returned by value.
    pub fn pop_before(&mut self, min: u64) -> Option<(u64, String)> {
        let head = self.head?;
        if self.slots[head].snum >= min {
            return None;
        }
        self.head = self.slots[head].next;
        if self.cursor == Some(head) {
            self.cursor = self.head;
        }
        let snum = self.slots[head].snum;
        let text = std::mem::take(&mut self.slots[head].text);
        self.free.push(head);
        Some((snum, text))
    }

    fn take_slot(&mut self, snum: u64) -> usize {
        if let Some(i) = self.free.pop() {
            self.reused += 1;
            self.slots[i].snum = snum;
            self.slots[i].text.clear();
            self.slots[i].next = None;
            i
        } else {
            self.allocated += 1;
            self.slots.push(QueueItem {
                snum,
                text: String::new(),
                next: None,
            });
            self.slots.len() - 1
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

struct ChannelDesc {
    /// Global channel index; for logic channels also the bit position in
    /// the packed image.
    index: usize,
    ty: ChannelType,
    name: String,
    id: String,
    /// Last delivered sample number: one past the newest sample this
    /// channel has contributed.
    last: u64,
}

/// Datafeed sink rendering the stream as a value change dump.
pub struct VcdWriter<W: Write> {
    out: W,
    channels: Vec<ChannelDesc>,
    /// channel index -> position in `channels`
    by_index: HashMap<usize, usize>,
    logic_count: usize,
    immediate: bool,
    samplerate: u64,
    timescale: u64,
    /// Timescale ticks per sample.
    period: u64,
    header_written: bool,
    prev_image: Option<Vec<u8>>,
    logic_snum: u64,
    queue: MergeQueue,
    /// Pending line in immediate mode.
    pending: Option<(u64, String)>,
    last_ts: Option<u64>,
    ended: bool,
}

impl<W: Write> VcdWriter<W> {
    /// Build a writer over the enabled channels of `info`. Fails with a
    /// capacity error when the identifier space cannot cover them.
    pub fn new(out: W, info: &DeviceInfo) -> HalResult<Self> {
        let mut channels = Vec::new();
        let mut by_index = HashMap::new();
        let mut logic_count = 0;
        let mut analog_count = 0;
        for ch in info.channels().iter().filter(|c| c.enabled()) {
            let id = identifier(channels.len())?;
            match ch.channel_type() {
                ChannelType::Logic => logic_count += 1,
                ChannelType::Analog => analog_count += 1,
            }
            by_index.insert(ch.index(), channels.len());
            channels.push(ChannelDesc {
                index: ch.index(),
                ty: ch.channel_type(),
                name: ch.name().to_owned(),
                id,
                last: 0,
            });
        }

        // The only configurations where arrival order cannot conflict.
        let immediate = analog_count == 0 || (logic_count == 0 && analog_count == 1);

        let samplerate = 1;
        let timescale = timescale_freq(samplerate);
        Ok(Self {
            out,
            channels,
            by_index,
            logic_count,
            immediate,
            samplerate,
            timescale,
            period: timescale / samplerate,
            header_written: false,
            prev_image: None,
            logic_snum: 0,
            queue: MergeQueue::new(),
            pending: None,
            last_ts: None,
            ended: false,
        })
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn set_samplerate(&mut self, samplerate: u64) {
        if samplerate == 0 {
            return;
        }
        if self.header_written {
            tracing::warn!(samplerate, "samplerate change after header ignored");
            return;
        }
        self.samplerate = samplerate;
        self.timescale = timescale_freq(samplerate);
        self.period = self.timescale / samplerate;
        if self.timescale % samplerate != 0 {
            tracing::warn!(
                samplerate,
                timescale = self.timescale,
                "timescale does not divide evenly, timestamps are approximate"
            );
        }
    }

    fn write_header(&mut self) -> HalResult<()> {
        let now = chrono::Local::now().format("%a %b %e %T %Y");
        writeln!(self.out, "$date {now} $end")?;
        writeln!(
            self.out,
            "$version {} {} VCD output $end",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )?;
        writeln!(
            self.out,
            "$comment\n  Acquisition with {} channels at {}\n$end",
            self.channels.len(),
            samplerate_string(self.samplerate)
        )?;
        writeln!(
            self.out,
            "$timescale {} $end",
            period_string(self.timescale)
        )?;
        writeln!(self.out, "$scope module {} $end", env!("CARGO_PKG_NAME"))?;
        for ch in &self.channels {
            match ch.ty {
                ChannelType::Logic => {
                    writeln!(self.out, "$var wire 1 {} {} $end", ch.id, ch.name)?;
                }
                ChannelType::Analog => {
                    writeln!(self.out, "$var real 64 {} {} $end", ch.id, ch.name)?;
                }
            }
        }
        writeln!(self.out, "$upscope $end")?;
        writeln!(self.out, "$enddefinitions $end")?;
        self.header_written = true;
        Ok(())
    }

    fn emit(&mut self, snum: u64, text: &str) -> HalResult<()> {
        let ts = snum * self.period;
        if let Some(last) = self.last_ts {
            if ts <= last {
                // The queue discipline makes this unreachable; skipping
                // keeps the output monotonic even if a driver misbehaves.
                tracing::warn!(ts, last, "dropping non-monotonic timestamp");
                return Ok(());
            }
        }
        writeln!(self.out, "#{ts}")?;
        writeln!(self.out, "{text}")?;
        self.last_ts = Some(ts);
        Ok(())
    }

    /// Route one token either to the immediate line or to the queue.
    fn add_token(&mut self, snum: u64, token: &str) -> HalResult<()> {
        if self.immediate {
            let pending_snum = self.pending.as_ref().map(|(s, _)| *s);
            if pending_snum.is_some() && pending_snum != Some(snum) {
                if let Some((done, text)) = self.pending.take() {
                    self.emit(done, &text)?;
                }
            }
            match &mut self.pending {
                Some((_, text)) => {
                    text.push(' ');
                    text.push_str(token);
                }
                None => self.pending = Some((snum, token.to_owned())),
            }
        } else {
            let slot = self.queue.position(snum);
            self.queue.append_value(slot, token);
        }
        Ok(())
    }

    /// Emit every queued entry below the minimum delivered sample number.
    fn flush(&mut self) -> HalResult<()> {
        let min = match self.channels.iter().map(|c| c.last).min() {
            Some(min) => min,
            None => return Ok(()),
        };
        while let Some((snum, text)) = self.queue.pop_before(min) {
            self.emit(snum, &text)?;
        }
        Ok(())
    }

    fn bit(image: &[u8], sample: usize, unit_size: usize, bit: usize) -> bool {
        let byte = image[sample * unit_size + bit / 8];
        byte & (1 << (bit % 8)) != 0
    }

    fn receive_logic(&mut self, unit_size: usize, data: &[u8]) -> HalResult<()> {
        if self.logic_count == 0 || unit_size == 0 {
            return Ok(());
        }
        if data.len() % unit_size != 0 {
            return Err(HalError::data(format!(
                "logic payload of {} bytes is not a multiple of unit size {unit_size}",
                data.len()
            )));
        }
        let count = data.len() / unit_size;
        if count == 0 {
            return Ok(());
        }

        for sample in 0..count {
            let snum = self.logic_snum + sample as u64;
            for pos in 0..self.channels.len() {
                let ch = &self.channels[pos];
                if ch.ty != ChannelType::Logic || ch.index / 8 >= unit_size {
                    continue;
                }
                let bit = ch.index;
                let cur = Self::bit(data, sample, unit_size, bit);
                let changed = match (&self.prev_image, sample) {
                    // First sample ever: dump every channel's value.
                    (None, 0) => true,
                    (Some(prev), 0) => {
                        prev.len() >= unit_size && Self::bit(prev, 0, unit_size, bit) != cur
                    }
                    _ => Self::bit(data, sample - 1, unit_size, bit) != cur,
                };
                if changed {
                    let token = format!("{}{}", u8::from(cur), self.channels[pos].id);
                    self.add_token(snum, &token)?;
                }
            }
        }

        self.logic_snum += count as u64;
        self.prev_image = Some(data[(count - 1) * unit_size..].to_vec());
        let new_last = self.logic_snum;
        for ch in &mut self.channels {
            if ch.ty == ChannelType::Logic {
                ch.last = new_last;
            }
        }
        Ok(())
    }

    fn receive_analog(&mut self, channel_index: usize, samples: &[f32]) -> HalResult<()> {
        let Some(&pos) = self.by_index.get(&channel_index) else {
            tracing::debug!(channel_index, "analog packet for unknown channel");
            return Ok(());
        };
        if self.channels[pos].ty != ChannelType::Analog {
            return Err(HalError::data(format!(
                "analog packet addresses logic channel {channel_index}"
            )));
        }
        let base = self.channels[pos].last;
        let id = self.channels[pos].id.clone();
        for (i, value) in samples.iter().enumerate() {
            let token = format!("r{value} {id}");
            self.add_token(base + i as u64, &token)?;
        }
        self.channels[pos].last = base + samples.len() as u64;
        Ok(())
    }

    /// Drain everything: every channel is declared done up to the highest
    /// delivered sample number, so the whole queue becomes emittable.
    fn finish(&mut self) -> HalResult<()> {
        let max = self.channels.iter().map(|c| c.last).max().unwrap_or(0);
        for ch in &mut self.channels {
            ch.last = max + 1;
        }
        self.flush()?;
        if let Some((snum, text)) = self.pending.take() {
            self.emit(snum, &text)?;
        }
        // Closing timestamp marking the end of the capture.
        let end_ts = max * self.period;
        if self.last_ts.map_or(true, |last| end_ts > last) {
            writeln!(self.out, "#{end_ts}")?;
        }
        self.out.flush()?;
        self.ended = true;

        let (allocated, reused) = self.queue.pool_stats();
        tracing::debug!(allocated, reused, "merge queue pool stats");
        Ok(())
    }
}

impl<W: Write + Send> DatafeedSink for VcdWriter<W> {
    fn name(&self) -> &'static str {
        "vcd"
    }

    fn receive(&mut self, packet: &FeedPacket) -> HalResult<()> {
        if self.ended {
            return Ok(());
        }
        match &packet.packet {
            Packet::Header => Ok(()),
            Packet::Meta(entries) => {
                for (key, value) in entries {
                    if *key == ConfigKey::Samplerate {
                        if let Some(rate) = value.as_u64() {
                            self.set_samplerate(rate);
                        }
                    }
                }
                Ok(())
            }
            Packet::Trigger | Packet::FrameBegin | Packet::FrameEnd => Ok(()),
            Packet::Logic(payload) => {
                if !self.header_written {
                    self.write_header()?;
                }
                self.receive_logic(payload.unit_size, &payload.data)?;
                self.flush()
            }
            Packet::Analog(payload) => {
                if !self.header_written {
                    self.write_header()?;
                }
                self.receive_analog(payload.channel_index, &payload.samples)?;
                self.flush()
            }
            Packet::End => {
                if !self.header_written {
                    self.write_header()?;
                }
                self.finish()
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_use_minimum_length() {
        assert_eq!(identifier(0).unwrap(), "!");
        assert_eq!(identifier(93).unwrap(), "~");
        assert_eq!(identifier(94).unwrap(), "aa");
        assert_eq!(identifier(94 + 25).unwrap(), "az");
        assert_eq!(identifier(94 + 26).unwrap(), "ba");
        assert_eq!(identifier(94 + 675).unwrap(), "zz");
        assert_eq!(identifier(94 + 676).unwrap(), "aaa");
        assert_eq!(identifier(MAX_IDENTIFIERS - 1).unwrap(), "zzz");
    }

    #[test]
    fn identifier_space_is_bounded() {
        assert!(matches!(
            identifier(MAX_IDENTIFIERS),
            Err(HalError::Capacity(_))
        ));
    }

    #[test]
    fn identifiers_are_injective() {
        let mut seen = std::collections::HashSet::new();
        for idx in 0..MAX_IDENTIFIERS {
            assert!(seen.insert(identifier(idx).unwrap()), "collision at {idx}");
        }
    }

    #[test]
    fn timescale_prefers_exact_division() {
        assert_eq!(timescale_freq(1), 1);
        assert_eq!(timescale_freq(1_000), 1_000);
        // 1 GHz does not divide by 400 MHz; 10 GHz does.
        assert_eq!(timescale_freq(400_000_000), 10_000_000_000);
        // 300 Hz never divides a power of ten; two extra decades, then
        // accept the imprecision.
        assert_eq!(timescale_freq(300), 100_000);
    }

    #[test]
    fn period_strings() {
        assert_eq!(period_string(1), "1 s");
        assert_eq!(period_string(1_000), "1 ms");
        assert_eq!(period_string(100_000), "10 us");
        assert_eq!(period_string(10_000_000_000), "100 ps");
    }

    #[test]
    fn queue_emits_in_order_regardless_of_arrival() {
        let mut q = MergeQueue::new();
        for snum in [7u64, 3, 9, 3, 1, 8] {
            let slot = q.position(snum);
            q.append_value(slot, &format!("v{snum}"));
        }
        let mut got = Vec::new();
        while let Some((snum, text)) = q.pop_before(u64::MAX) {
            got.push((snum, text));
        }
        assert_eq!(
            got,
            vec![
                (1, "v1".into()),
                (3, "v3 v3".into()),
                (7, "v7".into()),
                (8, "v8".into()),
                (9, "v9".into()),
            ]
        );
    }

    #[test]
    fn queue_matches_sorted_reference_on_random_interleavings() {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let mut deliveries: Vec<u64> = (0..40).map(|i| i % 13).collect();
            deliveries.shuffle(&mut rng);

            let mut q = MergeQueue::new();
            for &snum in &deliveries {
                let slot = q.position(snum);
                q.append_value(slot, "x");
            }
            let mut emitted = Vec::new();
            while let Some((snum, _)) = q.pop_before(u64::MAX) {
                emitted.push(snum);
            }

            let mut reference: Vec<u64> = deliveries.clone();
            reference.sort_unstable();
            reference.dedup();
            assert_eq!(emitted, reference);
        }
    }

    #[test]
    fn queue_respects_the_minimum_bound() {
        let mut q = MergeQueue::new();
        for snum in [0u64, 5, 9] {
            let slot = q.position(snum);
            q.append_value(slot, "t");
        }
        assert_eq!(q.pop_before(6).map(|(s, _)| s), Some(0));
        assert_eq!(q.pop_before(6).map(|(s, _)| s), Some(5));
        assert_eq!(q.pop_before(6), None);
        assert!(!q.is_empty());
    }

    #[test]
    fn queue_recycles_slots() {
        let mut q = MergeQueue::new();
        let slot = q.position(1);
        q.append_value(slot, "a");
        q.pop_before(2);
        q.position(4);
        let (allocated, reused) = q.pool_stats();
        assert_eq!(allocated, 1);
        assert_eq!(reused, 1);
    }
}
