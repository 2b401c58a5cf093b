//! 跨链手续费计算
//! 纯函数、全整数运算：rate = base + dest.feeBps (+ express)，fee = floor(amount * rate / 10000)，不低于最低手续费

use crate::domain::{Amount, BridgeError, NetworkDescriptor};

const BPS_DENOMINATOR: Amount = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    pub base_rate_bps: u32,
    pub express_rate_bps: u32,
    pub min_fee: Amount,
}

#[derive(Debug, Clone)]
pub struct FeeCalculator {
    schedule: FeeSchedule,
    attestation_overhead_secs: u64,
}

impl FeeCalculator {
    pub fn new(schedule: FeeSchedule, attestation_overhead_secs: u64) -> Self {
        Self {
            schedule,
            attestation_overhead_secs,
        }
    }

    pub fn schedule(&self) -> FeeSchedule {
        self.schedule
    }

    /// 只有目标链的费率参与计算；源链参数保留以便按线路定价
    pub fn compute_fee(
        &self,
        _source: &NetworkDescriptor,
        dest: &NetworkDescriptor,
        amount: Amount,
        express: bool,
    ) -> Result<Amount, BridgeError> {
        let mut rate = Amount::from(self.schedule.base_rate_bps) + Amount::from(dest.fee_basis_points);
        if express {
            rate += Amount::from(self.schedule.express_rate_bps);
        }

        let fee = amount
            .checked_mul(rate)
            .ok_or_else(|| BridgeError::Validation("amount too large for fee calculation".into()))?
            / BPS_DENOMINATOR;

        Ok(fee.max(self.schedule.min_fee))
    }

    /// 预计耗时（秒）：源链确认 + 签名收集 + 目标链确认；加急时签名收集开销减半
    pub fn estimate_time_secs(
        &self,
        source: &NetworkDescriptor,
        dest: &NetworkDescriptor,
        express: bool,
    ) -> u64 {
        let overhead = if express {
            self.attestation_overhead_secs / 2
        } else {
            self.attestation_overhead_secs
        };
        source
            .confirmation_time_secs()
            .saturating_add(overhead)
            .saturating_add(dest.confirmation_time_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AddressFormat;

    fn network(id: &str, bps: u32, confirmations: u64, block: u64) -> NetworkDescriptor {
        NetworkDescriptor {
            id: id.into(),
            enabled: true,
            required_confirmations: confirmations,
            fee_basis_points: bps,
            rpc_endpoint: "http://relayer".into(),
            block_time_secs: block,
            address_format: AddressFormat::Evm,
        }
    }

    fn calculator(min_fee: Amount) -> FeeCalculator {
        FeeCalculator::new(
            FeeSchedule {
                base_rate_bps: 50,
                express_rate_bps: 50,
                min_fee,
            },
            120,
        )
    }

    #[test]
    fn test_standard_fee() {
        let calc = calculator(0);
        let solana = network("solana", 25, 32, 1);
        let ethereum = network("ethereum", 100, 12, 12);

        // 1,000,000 * 150 / 10000
        assert_eq!(calc.compute_fee(&solana, &ethereum, 1_000_000, false).unwrap(), 15_000);
        assert_eq!(calc.compute_fee(&solana, &ethereum, 1_000_000, true).unwrap(), 20_000);
    }

    #[test]
    fn test_fee_is_floored_and_clamped() {
        let solana = network("solana", 25, 32, 1);
        let ethereum = network("ethereum", 100, 12, 12);

        // 999 * 150 / 10000 = 14.985 → 14
        assert_eq!(calculator(0).compute_fee(&solana, &ethereum, 999, false).unwrap(), 14);
        assert_eq!(calculator(1_000).compute_fee(&solana, &ethereum, 999, false).unwrap(), 1_000);
    }

    #[test]
    fn test_deterministic() {
        let calc = calculator(7);
        let a = network("a", 33, 1, 1);
        let b = network("b", 17, 1, 1);
        let first = calc.compute_fee(&a, &b, 123_456_789_012_345, true).unwrap();
        for _ in 0..1_000 {
            assert_eq!(calc.compute_fee(&a, &b, 123_456_789_012_345, true).unwrap(), first);
        }
    }

    #[test]
    fn test_overflow_is_rejected() {
        let calc = calculator(0);
        let a = network("a", 100, 1, 1);
        assert!(matches!(
            calc.compute_fee(&a, &a, u128::MAX, false),
            Err(BridgeError::Validation(_))
        ));
    }

    #[test]
    fn test_estimated_time() {
        let calc = calculator(0);
        let solana = network("solana", 25, 32, 1);
        let ethereum = network("ethereum", 100, 12, 12);
        assert_eq!(calc.estimate_time_secs(&solana, &ethereum, false), 32 + 120 + 144);
        assert_eq!(calc.estimate_time_secs(&solana, &ethereum, true), 32 + 60 + 144);
    }
}
