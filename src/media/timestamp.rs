use ffmpeg_next::{Rational, Rescale};
use tracing::{debug, warn};

/// Checks that both numerator and denominator are positive.
pub fn is_rational_valid(r: Rational) -> bool {
    r.numerator() > 0 && r.denominator() > 0
}

/// Per-output-stream timestamp bookkeeping of a recording session.
#[derive(Debug, Default, Clone)]
pub struct StreamClock {
    start_time: Option<i64>,
    next_pts: i64,
}

impl StreamClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a decoder timestamp to the encoder time base, relative to the
    /// first timestamp this clock has seen.
    pub fn rebase(&mut self, pts: i64, input_tb: Rational, output_tb: Rational) -> i64 {
        let start_time = *self.start_time.get_or_insert_with(|| {
            debug!(pts, ?input_tb, "Stream start time");
            pts
        });
        (pts - start_time).rescale(input_tb, output_tb)
    }

    /// Hands out a synthetic timestamp and advances it by `nb_samples`.
    pub fn advance(&mut self, nb_samples: i64) -> i64 {
        let pts = self.next_pts;
        self.next_pts += nb_samples;
        pts
    }

    /// Timestamp for an audio frame taken from the FIFO.
    ///
    /// Resampled audio carries no timestamp and gets a synthetic one counted
    /// in samples. A frame that does carry one is unexpected and goes through
    /// [`StreamClock::rebase`] instead of being dropped.
    pub fn audio_pts(
        &mut self,
        pts: Option<i64>,
        nb_samples: i64,
        input_tb: Rational,
        output_tb: Rational,
    ) -> i64 {
        match pts {
            None => self.advance(nb_samples),
            Some(pts) => {
                warn!(pts, "Unexpected timestamp on resampled audio frame");
                self.rebase(pts, input_tb, output_tb)
            }
        }
    }

    pub fn start_time(&self) -> Option<i64> {
        self.start_time
    }

    pub fn next_pts(&self) -> i64 {
        self.next_pts
    }
}

/// Keeps muxed DTS monotonic, the way ffmpeg's command line tool does.
#[derive(Debug, Clone)]
pub struct DtsGuard {
    last_dts: Option<i64>,
    strict: bool,
    enabled: bool,
}

impl DtsGuard {
    /// `strict` requires strictly increasing DTS; `enabled` is false for
    /// containers that carry no timestamps at all.
    pub fn new(strict: bool, enabled: bool) -> Self {
        Self {
            last_dts: None,
            strict,
            enabled,
        }
    }

    /// Returns the corrected `(pts, dts)` pair and remembers the DTS.
    pub fn fix(
        &mut self,
        stream_index: usize,
        mut pts: Option<i64>,
        mut dts: Option<i64>,
    ) -> (Option<i64>, Option<i64>) {
        if !self.enabled {
            return (pts, dts);
        }

        if let (Some(p), Some(d)) = (pts, dts)
            && d > p
        {
            warn!(stream_index, pts = p, dts = d, "Invalid DTS > PTS, replacing by guess");
            let last = self.last_dts.map_or(i64::MIN, |last| last.saturating_add(1));
            let median = p.max(d).min(last.max(p.min(d)));
            pts = Some(median);
            dts = Some(median);
        }

        if let (Some(d), Some(last)) = (dts, self.last_dts) {
            let max = last + i64::from(self.strict);
            if d < max {
                warn!(
                    stream_index,
                    previous = last,
                    current = d,
                    "Non-monotonic DTS, changing to {max}"
                );
                if let Some(p) = pts
                    && p >= d
                {
                    pts = Some(p.max(max));
                }
                dts = Some(max);
            }
        }

        self.last_dts = dts.or(self.last_dts);
        (pts, dts)
    }
}
