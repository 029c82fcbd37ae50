use tensorize::policy::{ProblemExtents, TilePlanner};
use tensorize::{Conv2dOp, DType, DimFactors, HardwareTarget, SynthesisConfig, TensorizeError, TileFactors, TileShape};

fn planner() -> TilePlanner {
    TilePlanner::new(HardwareTarget::volta(), DType::Float16)
}

#[test]
fn test_reference_workload_extents() {
    let extents = ProblemExtents::of(&Conv2dOp::reference_workload());
    assert_eq!(extents, ProblemExtents { batch: 256, out_channels: 512, in_channels: 256 });
    let plan = planner().plan(extents, &SynthesisConfig::default()).unwrap();
    assert_eq!(plan.batch.product(), Some(256));
    assert_eq!(plan.out_channels.product(), Some(512));
    assert_eq!(plan.in_channels.product(), Some(256));
}

#[test]
fn test_product_must_cover_extent() {
    let mut factors = TileFactors::default();
    factors.batch = DimFactors::new(2, 2, 2, 16);
    let err = planner()
        .plan(ProblemExtents { batch: 256, out_channels: 512, in_channels: 256 }, &SynthesisConfig::new(factors))
        .unwrap_err();
    match err {
        TensorizeError::InfeasibleFactorization { dim, factors, total, .. } => {
            assert_eq!(dim, "batch");
            assert_eq!(factors, vec![2, 2, 2, 16]);
            assert_eq!(total, 256);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn test_zero_factor_and_foreign_tile() {
    let extents = ProblemExtents { batch: 256, out_channels: 512, in_channels: 256 };
    let mut factors = TileFactors::default();
    factors.out_channels = DimFactors::new(0, 2, 4, 16);
    assert!(planner().plan(extents, &SynthesisConfig::new(factors)).is_err());

    let target = HardwareTarget::volta().with_tile(TileShape::new(8, 32, 16));
    let err = TilePlanner::new(target, DType::Float16)
        .plan(extents, &SynthesisConfig::default())
        .unwrap_err();
    assert!(matches!(err, TensorizeError::InfeasibleFactorization { reason, .. } if reason.contains("hardware tile")));
}

#[test]
fn test_overflowing_factors_from_json() {
    let json = format!(
        r#"{{
        "batch": {{ "outer": {max}, "vector": {max}, "thread": 2, "tile": 16 }},
        "out_channels": {{ "outer": 8, "vector": 1, "thread": 4, "tile": 16 }},
        "in_channels": {{ "outer": 4, "vector": 4, "thread": 1, "tile": 16 }}
    }}"#,
        max = usize::MAX
    );
    let factors = TileFactors::from_json(&json).unwrap();
    assert_eq!(factors.batch.product(), None);
    let err = planner()
        .plan(ProblemExtents { batch: 256, out_channels: 512, in_channels: 256 }, &SynthesisConfig::new(factors))
        .unwrap_err();
    assert!(matches!(err, TensorizeError::InfeasibleFactorization { dim, reason, .. }
        if dim == "batch" && reason.contains("overflows")));
}

#[test]
fn test_thread_budget() {
    let extents = ProblemExtents { batch: 256, out_channels: 512, in_channels: 256 };
    let mut target = HardwareTarget::volta();
    target.max_threads_per_block = 8;
    let err = TilePlanner::new(target, DType::Float16)
        .plan(extents, &SynthesisConfig::default())
        .unwrap_err();
    assert!(matches!(err, TensorizeError::InfeasibleFactorization { dim, .. } if dim == "threads"));
}

#[test]
fn test_factors_from_json() {
    let json = r#"{
        "batch": { "outer": 8, "vector": 1, "thread": 2, "tile": 16 },
        "out_channels": { "outer": 8, "vector": 1, "thread": 4, "tile": 16 },
        "in_channels": { "outer": 4, "vector": 4, "thread": 1, "tile": 16 }
    }"#;
    let factors = TileFactors::from_json(json).unwrap();
    let plan = planner()
        .plan(ProblemExtents { batch: 256, out_channels: 512, in_channels: 256 }, &SynthesisConfig::new(factors))
        .unwrap();
    assert_eq!(plan.threads_per_block, 16);
}
