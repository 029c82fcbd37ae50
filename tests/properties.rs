use proptest::prelude::*;
use tensorize::policy::{ProblemExtents, TilePlanner};
use tensorize::schedule::Schedule;
use tensorize::te::{compute, placeholder, Affine, Expr, IterVar};
use tensorize::{
    CompilationRecipe, DType, DimFactors, HardwareTarget, ShapeKey, SynthesisConfig, TenetConvRecipe,
    TensorizeError, TileFactors,
};

const KEYS: [&str; 4] = ["load_a", "load_b", "mma", "store"];

proptest! {
    #[test]
    fn prop_shape_key_round_trip(dims in prop::array::uniform6(1usize..512)) {
        let [k, p, q, c, r, s] = dims;
        let key = ShapeKey::new(k, p, q, c, r, s).unwrap();
        prop_assert_eq!(ShapeKey::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn prop_parsed_key_is_canonical(fields in prop::array::uniform6("[0-9]{1,4}")) {
        let text = fields.join("x");
        if let Ok(key) = ShapeKey::parse(&text) {
            prop_assert_eq!(key.to_string(), text);
        }
    }

    #[test]
    fn prop_dag_build_is_idempotent(mask in 1usize..16) {
        let recipe = TenetConvRecipe::fp16_fp16().unwrap();
        let requested: Vec<&str> = KEYS
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, k)| *k)
            .collect();
        let first = recipe
            .dag_compute_expression_with_inputs("16x4x4x16x1x1", &requested, recipe.edges())
            .unwrap();
        let second = recipe
            .dag_compute_expression_with_inputs("16x4x4x16x1x1", &requested, recipe.edges())
            .unwrap();
        prop_assert_eq!(first.outputs.len(), requested.len());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_planner_accepts_only_exact_products(
        outer in 1usize..8,
        vector in 1usize..4,
        slack in 0usize..2,
    ) {
        let planner = TilePlanner::new(HardwareTarget::volta(), DType::Float16);
        let mut factors = TileFactors::default();
        factors.batch = DimFactors::new(outer, vector, 2, 16);
        let extents = ProblemExtents {
            batch: factors.batch.product().unwrap() + slack * 16,
            out_channels: 512,
            in_channels: 256,
        };
        match planner.plan(extents, &SynthesisConfig::new(factors)) {
            Ok(plan) => {
                prop_assert_eq!(slack, 0);
                prop_assert_eq!(plan.batch.product(), Some(extents.batch));
            }
            Err(err) => {
                prop_assert!(slack > 0);
                let is_infeasible = matches!(err, TensorizeError::InfeasibleFactorization { .. });
                prop_assert!(is_infeasible);
            }
        }
    }

    #[test]
    fn prop_split_requires_divisor(extent in 1usize..256, nparts in 1usize..32) {
        let a = placeholder(&[extent], DType::Float32, "A");
        let b = compute(&[extent], "B", |ax| a.load(ax.to_vec()));
        let mut sch = Schedule::create(&[&b]).unwrap();
        let stage = sch.stage_of(&b).unwrap();
        let axis = sch.axis(stage, 0).unwrap();
        match sch.split(stage, axis, nparts) {
            Ok((outer, inner)) => {
                prop_assert_eq!(extent % nparts, 0);
                let s = sch.stage(stage);
                prop_assert_eq!(s.get_loop(outer).extent * s.get_loop(inner).extent, extent);
            }
            Err(err) => {
                prop_assert!(extent % nparts != 0);
                let is_indivisible = matches!(err, TensorizeError::IndivisibleSplit { .. });
                prop_assert!(is_indivisible);
            }
        }
    }

    #[test]
    fn prop_span_of_strided_window(stride in 1i64..4, out in 1usize..16, tap in 1usize..5) {
        // p * stride + r covers (out - 1) * stride + tap rows.
        let index = IterVar::data("p", out).expr() * Expr::Int(stride) + IterVar::reduce("r", tap).expr();
        let affine: Affine = index.affine().unwrap();
        let extents = [("p".to_string(), out), ("r".to_string(), tap)].into_iter().collect();
        prop_assert_eq!(affine.span(&extents), (out - 1) * stride as usize + tap);
    }
}
