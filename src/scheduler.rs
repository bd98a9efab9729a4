use serde::{Deserialize, Serialize};

/// ウォームアップ・クールダウン型の学習率スケジューラ
///
/// `warmup_steps` かけて線形に `peak_lr` まで上昇し、その後
/// `cooldown_steps` かけて線形に0まで減衰する。スケジュール全長を
/// 超えた `advance` 呼び出しは明示的な境界チェックで無視される
/// （エラーにはならず、学習率は最終値のまま固定される）。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WarmupCooldownLr {
    peak_lr: f64,
    warmup_steps: usize,
    cooldown_steps: usize,
    step: usize,
}

impl WarmupCooldownLr {
    pub fn new(peak_lr: f64, warmup_steps: usize, cooldown_steps: usize) -> Self {
        Self {
            peak_lr,
            warmup_steps,
            cooldown_steps,
            step: 0,
        }
    }

    /// スケジュール全長（ウォームアップ + クールダウン）
    pub fn total_steps(&self) -> usize {
        self.warmup_steps + self.cooldown_steps
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// ウォームアップフェーズ中かどうか
    pub fn in_warmup(&self) -> bool {
        self.step < self.warmup_steps
    }

    /// 現在のステップ位置に対応する学習率
    pub fn current_lr(&self) -> f64 {
        if self.step < self.warmup_steps {
            // 上昇フェーズ: 1ステップ目からpeakに向かって線形増加
            self.peak_lr * (self.step + 1) as f64 / self.warmup_steps.max(1) as f64
        } else {
            // 減衰フェーズ: peakから0へ線形減少
            let done = (self.step - self.warmup_steps).min(self.cooldown_steps);
            let remaining = (self.cooldown_steps - done) as f64;
            self.peak_lr * remaining / self.cooldown_steps.max(1) as f64
        }
    }

    /// 1ステップ進めて、そのステップで使う学習率を返す
    ///
    /// スケジュール全長に達した後は内部カウンタを進めない（no-op）。
    pub fn advance(&mut self) -> f64 {
        let lr = self.current_lr();
        if self.step < self.total_steps() {
            self.step += 1;
        }
        lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_rises_linearly() {
        let mut sched = WarmupCooldownLr::new(1.0, 4, 4);

        assert!(sched.in_warmup());
        assert!((sched.advance() - 0.25).abs() < 1e-12);
        assert!((sched.advance() - 0.5).abs() < 1e-12);
        assert!((sched.advance() - 0.75).abs() < 1e-12);
        assert!((sched.advance() - 1.0).abs() < 1e-12);
        assert!(!sched.in_warmup());
    }

    #[test]
    fn test_cooldown_decays_to_zero() {
        let mut sched = WarmupCooldownLr::new(1.0, 2, 4);
        for _ in 0..2 {
            sched.advance();
        }

        assert!((sched.advance() - 1.0).abs() < 1e-12);
        assert!((sched.advance() - 0.75).abs() < 1e-12);
        assert!((sched.advance() - 0.5).abs() < 1e-12);
        assert!((sched.advance() - 0.25).abs() < 1e-12);
        assert!((sched.current_lr() - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_advance_past_horizon_is_noop() {
        let mut sched = WarmupCooldownLr::new(1.0, 2, 2);
        for _ in 0..4 {
            sched.advance();
        }
        assert_eq!(sched.step(), 4);

        // 全長を超えてもステップカウンタは進まず、エラーにもならない
        for _ in 0..10 {
            sched.advance();
        }
        assert_eq!(sched.step(), sched.total_steps());
        assert!((sched.current_lr() - 0.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_warmup_is_guarded() {
        let mut sched = WarmupCooldownLr::new(1.0, 0, 2);
        // ウォームアップなしでも0割りせず、即座に減衰フェーズに入る
        assert!((sched.advance() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_state_roundtrips_through_serde() {
        let mut sched = WarmupCooldownLr::new(0.5, 3, 7);
        for _ in 0..5 {
            sched.advance();
        }

        let json = serde_json::to_string(&sched).unwrap();
        let restored: WarmupCooldownLr = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, sched);
        assert!((restored.current_lr() - sched.current_lr()).abs() < 1e-12);
    }
}
