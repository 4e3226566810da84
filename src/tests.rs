use crate::{
    initial_transformation, learn_distance, Configuration, DecomposableFunction, NcaError,
    OptimizerKind, SoftmaxErrorFunction,
};
use approx::assert_abs_diff_eq;
use ndarray::{array, Array1, Array2, Zip};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_pcg::Pcg64Mcg;

/// Two well separated clusters of three points each.
fn separated_clusters() -> (Array2<f64>, Array1<usize>) {
    let data = array![
        [0.0, 0.0, 1.0, 10.0, 10.0, 11.0],
        [0.0, 1.0, 0.0, 0.0, 1.0, 0.0]
    ];
    (data, array![0, 0, 0, 1, 1, 1])
}

/// Two classes told apart by the first feature only; the second feature is
/// noise on a larger scale.
#[allow(clippy::cast_precision_loss)]
fn noisy_classes(n: usize) -> (Array2<f64>, Array1<usize>) {
    let mut rng = Pcg64Mcg::new(42);
    let mut data = Array2::random_using((2, n), Uniform::new(-0.3, 0.3), &mut rng);
    let noise = Array1::random_using(n, Uniform::new(-2.0, 2.0), &mut rng);
    data.row_mut(1).assign(&noise);

    let labels = Array1::from_iter((0..n).map(|i| i % 2));
    for (i, &label) in labels.iter().enumerate() {
        data[[0, i]] += label as f64;
    }
    (data, labels)
}

fn objective(data: &Array2<f64>, labels: &Array1<usize>, transformation: &Array2<f64>) -> f64 {
    SoftmaxErrorFunction::new(data.view(), labels.view())
        .unwrap()
        .evaluate(transformation.view())
}

#[test]
fn test_configuration_builder() {
    let config = Configuration::builder()
        .optimizer(OptimizerKind::Lbfgs)
        .num_basis(10)
        .normalize(true)
        .seed(42)
        .build();

    assert_eq!(config.optimizer, OptimizerKind::Lbfgs);
    assert_eq!(config.num_basis, 10);
    assert!(config.normalize);
    assert_eq!(config.seed, Some(42));
    // Unset options keep their defaults
    assert_eq!(config.max_iterations, 500_000);
    assert_eq!(config.batch_size, 50);
    assert_abs_diff_eq!(config.tolerance, 1e-7);
    assert_abs_diff_eq!(config.armijo_constant, 1e-4);
}

#[test]
fn test_builder_defaults_match_default() {
    let built = Configuration::builder().build();
    let default = Configuration::default();

    assert_eq!(built.optimizer, default.optimizer);
    assert_eq!(built.max_iterations, default.max_iterations);
    assert_eq!(built.batch_size, default.batch_size);
    assert_eq!(built.linear_scan, default.linear_scan);
    assert_eq!(built.num_basis, default.num_basis);
    assert_eq!(built.max_line_search_trials, default.max_line_search_trials);
    assert_abs_diff_eq!(built.step_size, default.step_size);
    assert_abs_diff_eq!(built.wolfe, default.wolfe);
    assert_abs_diff_eq!(built.min_step, default.min_step);
    assert_abs_diff_eq!(built.max_step, default.max_step);
}

#[test]
fn test_identity_start() {
    let (data, _) = separated_clusters();
    assert_eq!(initial_transformation(data.view(), false), Array2::eye(2));
}

#[test]
fn test_normalized_start_uses_inverse_ranges() {
    let data = array![[0.0, 4.0, 2.0], [1.0, 1.5, 1.0], [3.0, 3.0, 3.0]];

    let transformation = initial_transformation(data.view(), true);

    assert_eq!(
        transformation,
        array![[0.25, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 1.0]]
    );
}

#[test]
fn test_separated_clusters_stay_optimal() {
    let (data, labels) = separated_clusters();
    let identity_objective = objective(&data, &labels, &Array2::eye(2));
    assert_abs_diff_eq!(identity_objective, -6.0, epsilon = 1e-6);

    for kind in [OptimizerKind::Sgd, OptimizerKind::Lbfgs] {
        let config = Configuration::builder()
            .optimizer(kind)
            .max_iterations(600)
            .seed(1)
            .build();

        let transformation = learn_distance(data.view(), labels.view(), &config).unwrap();

        let learned = objective(&data, &labels, &transformation);
        assert!(learned <= identity_objective + 1e-6, "{kind} degraded the objective to {learned}");
        assert_abs_diff_eq!(learned, -6.0, epsilon = 1e-6);
    }
}

#[test]
fn test_unbounded_sgd_terminates() {
    let (data, labels) = separated_clusters();
    let config = Configuration::builder()
        .max_iterations(0)
        .tolerance(1e-12)
        .seed(5)
        .build();

    let transformation = learn_distance(data.view(), labels.view(), &config).unwrap();

    assert_eq!(transformation.dim(), (2, 2));
    assert!(transformation.iter().all(|v| v.is_finite()));
}

#[test]
fn test_normalize_with_constant_feature() {
    let data = array![[0.0, 1.0, 5.0, 6.0], [2.0, 2.0, 2.0, 2.0]];
    let labels = array![0, 0, 1, 1];
    let config = Configuration::builder()
        .normalize(true)
        .max_iterations(40)
        .seed(3)
        .build();

    let transformation = learn_distance(data.view(), labels.view(), &config).unwrap();

    assert!(transformation.iter().all(|v| v.is_finite()));
}

#[test]
fn test_optimizers_improve_on_noisy_classes() {
    let (data, labels) = noisy_classes(30);
    let identity_objective = objective(&data, &labels, &Array2::eye(2));

    let sgd = Configuration::builder()
        .step_size(1e-3)
        .batch_size(10)
        .max_iterations(30 * 20)
        .tolerance(1e-10)
        .seed(8)
        .build();
    let lbfgs = Configuration::builder()
        .optimizer(OptimizerKind::Lbfgs)
        .max_iterations(25)
        .tolerance(1e-4)
        .build();

    let sgd_transformation = learn_distance(data.view(), labels.view(), &sgd).unwrap();
    let lbfgs_transformation = learn_distance(data.view(), labels.view(), &lbfgs).unwrap();

    let sgd_objective = objective(&data, &labels, &sgd_transformation);
    let lbfgs_objective = objective(&data, &labels, &lbfgs_transformation);
    assert!(
        sgd_objective <= identity_objective,
        "SGD: {sgd_objective} vs identity {identity_objective}"
    );
    assert!(
        lbfgs_objective < identity_objective,
        "L-BFGS: {lbfgs_objective} vs identity {identity_objective}"
    );

    // The noise feature should lose weight relative to the informative one
    let informative = lbfgs_transformation.column(0).dot(&lbfgs_transformation.column(0));
    let noise = lbfgs_transformation.column(1).dot(&lbfgs_transformation.column(1));
    assert!(noise < informative, "noise weight {noise} >= informative {informative}");
}

#[test]
fn test_seeded_runs_are_reproducible() {
    let (data, labels) = noisy_classes(20);
    let config = Configuration::builder()
        .step_size(1e-3)
        .batch_size(3)
        .max_iterations(200)
        .seed(17)
        .build();

    let first = learn_distance(data.view(), labels.view(), &config).unwrap();
    let second = learn_distance(data.view(), labels.view(), &config).unwrap();

    // Thread scheduling may reorder floating point sums
    Zip::from(&first).and(&second).for_each(|&a, &b| {
        assert_abs_diff_eq!(a, b, epsilon = 1e-9);
    });
}

#[test]
fn test_learns_with_debug_logging() {
    let (data, labels) = separated_clusters();
    let config = Configuration::builder()
        .optimizer(OptimizerKind::Lbfgs)
        .max_iterations(5)
        .build();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .finish();

    let result = tracing::subscriber::with_default(subscriber, || {
        learn_distance(data.view(), labels.view(), &config)
    });

    assert_eq!(result.unwrap().dim(), (2, 2));
}

#[test]
fn test_label_count_mismatch() {
    let (data, _) = separated_clusters();
    let labels = array![0, 1];

    let result = learn_distance(data.view(), labels.view(), &Configuration::default());

    assert!(matches!(
        result,
        Err(NcaError::LabelCountMismatch {
            labels: 2,
            points: 6
        })
    ));
}

#[test]
fn test_unknown_optimizer_name() {
    let result = "newton".parse::<OptimizerKind>();

    assert!(matches!(result, Err(NcaError::UnknownOptimizer(ref name)) if name == "newton"));
}
