use crate::common::Dtype;
use crate::error::{fail, TilingError};
use crate::shape::GroupOpt;
use crate::target::HardwareCapabilities;
use crate::utils::{ceil_div, lcm};
use log::debug;

/// Folds `groups` so each folded group's channel counts line up with the
/// cube unit's K and N widths.
///
/// Each original group holds `cin / groups` input and `cout / groups` output
/// channels. Merging `enlarge` consecutive groups multiplies both by
/// `enlarge`; the smallest merge that aligns both to `k0`/`n0` is chosen,
/// capped at `groups`.
pub fn optimize_groups(
    groups: i64,
    cin: i64,
    cout: i64,
    dtype: Dtype,
    caps: &HardwareCapabilities,
) -> Result<GroupOpt, TilingError> {
    let i32_max = i64::from(i32::MAX);
    if groups < 1 || cin < 1 || cout < 1 {
        return fail(TilingError::GroupConvOptFailed(format!(
            "groups={groups}, cin={cin}, cout={cout} must all be >= 1"
        )));
    }
    if groups > i32_max || cin > i32_max || cout > i32_max {
        return fail(TilingError::GroupConvOptFailed(format!(
            "groups={groups}, cin={cin}, cout={cout} exceed the int32 range"
        )));
    }
    let (groups, cin, cout) = (groups as u64, cin as u64, cout as u64);
    if groups == 1 {
        return Ok(GroupOpt {
            group_opt: 1,
            cin_opt: cin,
            cout_opt: cout,
        });
    }
    let cube = match dtype.cube_info() {
        Some(cube) if caps.group_opt_dtypes.contains(&dtype) => cube,
        _ => {
            return fail(TilingError::GroupConvOptFailed(format!(
                "group folding does not support {dtype}"
            )))
        }
    };
    if cin % groups != 0 || cout % groups != 0 {
        return fail(TilingError::GroupConvOptFailed(format!(
            "cin={cin} and cout={cout} must be divisible by groups={groups}"
        )));
    }

    let cin_per_group = cin / groups;
    let cout_per_group = cout / groups;
    let overflow = || {
        TilingError::GroupConvOptFailed(format!(
            "enlarge factor overflows for cin/group={cin_per_group}, cout/group={cout_per_group}"
        ))
    };
    let cin_enlarge = lcm(cin_per_group, cube.k0).ok_or_else(overflow)? / cin_per_group;
    let cout_enlarge = lcm(cout_per_group, cube.n0).ok_or_else(overflow)? / cout_per_group;
    let enlarge = lcm(cin_enlarge, cout_enlarge)
        .ok_or_else(overflow)?
        .min(groups);

    let group_opt = ceil_div(groups, enlarge);
    let (Some(cin_opt), Some(cout_opt)) = (
        cin_per_group.checked_mul(enlarge),
        cout_per_group.checked_mul(enlarge),
    ) else {
        return fail(overflow());
    };
    if cin_opt > i32::MAX as u64 || cout_opt > i32::MAX as u64 {
        return fail(TilingError::GroupConvOptFailed(format!(
            "cinOpt={cin_opt}, coutOpt={cout_opt} exceed the int32 range"
        )));
    }
    debug!("group folding: groups={groups} enlarge={enlarge} groupOpt={group_opt} cinOpt={cin_opt} coutOpt={cout_opt}");
    Ok(GroupOpt {
        group_opt,
        cin_opt,
        cout_opt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::SocVersion;
    use proptest::prelude::*;

    fn caps() -> HardwareCapabilities {
        SocVersion::Ascend910B.capabilities()
    }

    #[test]
    fn test_single_group_is_identity() {
        let opt = optimize_groups(1, 31, 7, Dtype::Bf16, &caps()).unwrap();
        assert_eq!((opt.group_opt, opt.cin_opt, opt.cout_opt), (1, 31, 7));
    }

    #[test]
    fn test_folds_small_groups() {
        let opt = optimize_groups(4, 32, 64, Dtype::Bf16, &caps()).unwrap();
        assert_eq!((opt.group_opt, opt.cin_opt, opt.cout_opt), (2, 16, 32));
        let opt = optimize_groups(8, 64, 128, Dtype::Bf16, &caps()).unwrap();
        assert_eq!((opt.group_opt, opt.cin_opt, opt.cout_opt), (4, 16, 32));
    }

    #[test]
    fn test_already_aligned_groups_unchanged() {
        let opt = optimize_groups(2, 64, 64, Dtype::Float16, &caps()).unwrap();
        assert_eq!((opt.group_opt, opt.cin_opt, opt.cout_opt), (2, 32, 32));
    }

    #[test]
    fn test_indivisible_channels_fail() {
        for cin in [32, 31] {
            assert!(matches!(
                optimize_groups(3, cin, 48, Dtype::Bf16, &caps()),
                Err(TilingError::GroupConvOptFailed(_))
            ));
        }
    }

    #[test]
    fn test_int32_overflow_fails() {
        assert!(optimize_groups(1, 3_000_000_000, 16, Dtype::Bf16, &caps()).is_err());
        assert!(optimize_groups(1, 16, 3_000_000_000, Dtype::Bf16, &caps()).is_err());
    }

    proptest! {
        #[test]
        fn test_folding_preserves_channels(
            groups in 1i64..64,
            cin_pg in 1i64..64,
            cout_pg in 1i64..64,
        ) {
            let opt = optimize_groups(groups, cin_pg * groups, cout_pg * groups, Dtype::Bf16, &caps()).unwrap();
            let enlarge = opt.cin_opt / cin_pg as u64;
            prop_assert_eq!(opt.cout_opt, cout_pg as u64 * enlarge);
            prop_assert!(enlarge <= groups as u64);
            prop_assert!(opt.group_opt * enlarge >= groups as u64);
        }
    }
}
