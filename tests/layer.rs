//! End-to-end tests for the layer entry points: hand-derived expected
//! values, probability normalization, precondition failures, and
//! persistence.

use approx::assert_abs_diff_eq;
use ndarray::{array, Array1, Axis};
use rstest::rstest;

use softmax_tree::testing::{mixed_arity_tree, seeded_layer, two_level_layer, two_level_tree};
use softmax_tree::{SoftmaxTree, SoftmaxTreeError, TreeIndex};

// =============================================================================
// Test Helpers
// =============================================================================

/// Naive, non-fused recomputation of one sample's log-probability: plain
/// softmax per node, log taken afterwards.
fn naive_log_prob(layer: &SoftmaxTree<f64>, input: &Array1<f64>, leaf_id: i64) -> f64 {
    let tree = layer.tree();
    let mut node = tree.resolve(leaf_id).unwrap();
    let mut total = 0.0;
    loop {
        let (parent, pos) = tree.parent_of(node).unwrap();
        let (offset, n) = tree.children_of(parent).unwrap();

        let logits: Vec<f64> = (0..n)
            .map(|j| layer.weight().row(offset + j).dot(input) + layer.bias()[offset + j])
            .collect();
        let denom: f64 = logits.iter().map(|z| z.exp()).sum();
        total += (logits[pos].exp() / denom).ln();

        if parent == tree.root() {
            break;
        }
        node = parent;
    }
    total
}

// =============================================================================
// Forward Correctness
// =============================================================================

#[test]
fn two_level_scenario_matches_hand_computation() {
    let mut layer = two_level_layer::<f64>();
    let input = array![[1.0, 2.0, 3.0]];
    let out = layer.update_output(input.view(), &[4]).unwrap();

    // Leaf 4 sits under node 2 which sits under the root.
    // Node 2's softmax over rows 2..4: logits [0.3, 0.2], position 0 taken.
    // Root's softmax over rows 0..2: logits [0.1, 0.3], position 0 taken.
    let level2 = 0.3 - (0.3f64.exp() + 0.2f64.exp()).ln();
    let level1 = 0.1 - (0.1f64.exp() + 0.3f64.exp()).ln();
    assert_abs_diff_eq!(out[0], level1 + level2, epsilon = 1e-12);
}

#[rstest]
#[case::shallow_leaf(3)]
#[case::mid_leaf(5)]
#[case::deep_leaf(9)]
fn forward_matches_naive_recomputation(#[case] target: i64) {
    let mut layer = seeded_layer(mixed_arity_tree(), 4, 42);
    let input = array![[0.4, -1.1, 0.9, 0.2]];

    let out = layer.update_output(input.view(), &[target]).unwrap();
    let expected = naive_log_prob(&layer, &array![0.4, -1.1, 0.9, 0.2], target);
    assert_abs_diff_eq!(out[0], expected, epsilon = 1e-10);
}

#[rstest]
#[case::two_level(two_level_tree(), 5)]
#[case::mixed_arity(mixed_arity_tree(), 17)]
fn leaf_probabilities_normalize(#[case] tree: TreeIndex, #[case] seed: u64) {
    let mut layer = seeded_layer(tree, 4, seed);
    let leaves = layer.tree().leaves();
    let input = array![[0.5, -0.3, 1.2, 0.0]];

    let total: f64 = leaves
        .iter()
        .map(|&leaf| {
            let out = layer
                .update_output(input.view(), &[leaf as i64 + 1])
                .unwrap();
            out[0].exp()
        })
        .sum();

    assert_abs_diff_eq!(total, 1.0, epsilon = 1e-5);
}

#[test]
fn batch_matches_single_sample_calls() {
    let mut layer = seeded_layer(mixed_arity_tree(), 3, 9);
    let input = array![[0.1, 0.2, 0.3], [-0.5, 0.4, 0.0], [1.0, -1.0, 0.5]];
    let targets = [5i64, 3, 9];
    let grad_output = array![1.0, -0.5, 2.0];

    let out = layer.update_output(input.view(), &targets).unwrap();
    let grad = layer
        .update_grad_input(input.view(), grad_output.view(), &targets)
        .unwrap();

    for i in 0..3 {
        let row = input.row(i).insert_axis(Axis(0)).to_owned();
        let single_out = layer.update_output(row.view(), &[targets[i]]).unwrap();
        let single_grad = layer
            .update_grad_input(row.view(), array![grad_output[i]].view(), &[targets[i]])
            .unwrap();

        assert_abs_diff_eq!(out[i], single_out[0], epsilon = 1e-12);
        for d in 0..3 {
            assert_abs_diff_eq!(grad[[i, d]], single_grad[[0, d]], epsilon = 1e-12);
        }
    }
}

#[test]
fn f32_and_f64_instantiations_agree() {
    let mut layer64 = two_level_layer::<f64>();
    let mut layer32 = two_level_layer::<f32>();

    let input64 = array![[1.0f64, 2.0, 3.0]];
    let input32 = array![[1.0f32, 2.0, 3.0]];

    let out64 = layer64.update_output(input64.view(), &[4]).unwrap();
    let out32 = layer32.update_output(input32.view(), &[4]).unwrap();

    assert_abs_diff_eq!(out64[0], out32[0] as f64, epsilon = 1e-5);

    let grad64 = layer64
        .update_grad_input(input64.view(), array![1.0f64].view(), &[4])
        .unwrap();
    let grad32 = layer32
        .update_grad_input(input32.view(), array![1.0f32].view(), &[4])
        .unwrap();
    for d in 0..3 {
        assert_abs_diff_eq!(grad64[[0, d]], grad32[[0, d]] as f64, epsilon = 1e-5);
    }
}

// =============================================================================
// Preconditions
// =============================================================================

#[test]
fn backward_before_forward_is_stale() {
    let layer = two_level_layer::<f64>();
    let input = array![[1.0, 2.0, 3.0]];

    let err = layer
        .update_grad_input(input.view(), array![1.0].view(), &[4])
        .unwrap_err();
    assert!(matches!(err, SoftmaxTreeError::StaleCache { populated: 0, .. }));
}

#[test]
fn backward_on_deeper_target_than_forward_is_stale() {
    let mut layer = two_level_layer::<f64>();
    let input = array![[1.0, 2.0, 3.0]];

    // Forward on leaf 3 (depth 1) populates 2 entries; replaying leaf 4
    // (depth 2) needs 4.
    layer.update_output(input.view(), &[3]).unwrap();
    let err = layer
        .update_grad_input(input.view(), array![1.0].view(), &[4])
        .unwrap_err();
    assert_eq!(err, SoftmaxTreeError::StaleCache { required: 4, populated: 2 });
}

#[test]
fn acc_grad_before_forward_is_stale() {
    let mut layer = two_level_layer::<f64>();
    let input = array![[1.0, 2.0, 3.0]];

    let err = layer
        .acc_grad_parameters(input.view(), array![1.0].view(), &[4], 1.0)
        .unwrap_err();
    assert!(matches!(err, SoftmaxTreeError::StaleCache { populated: 0, .. }));
}

#[test]
fn orphan_target_is_tree_integrity_error() {
    // Node 4 exists in the id space but has no parent entry.
    let tree = TreeIndex::from_tables(
        &[(-1, -1), (1, 1), (1, 2), (-1, -1)],
        &[(1, 2), (-1, -1), (-1, -1), (-1, -1)],
        1,
    )
    .unwrap();
    let mut layer = SoftmaxTree::<f64>::new(2, tree);
    let input = array![[1.0, -1.0]];

    let err = layer.update_output(input.view(), &[4]).unwrap_err();
    assert_eq!(err, SoftmaxTreeError::NoParent { node: 3 });
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn tree_index_serde_round_trip() {
    let tree = mixed_arity_tree();
    let json = serde_json::to_string(&tree).unwrap();
    let back: TreeIndex = serde_json::from_str(&json).unwrap();
    assert_eq!(tree, back);
}

#[test]
fn layer_serde_round_trip_preserves_parameters() {
    let layer = seeded_layer(two_level_tree(), 3, 11);
    let json = serde_json::to_string(&layer).unwrap();
    let back: SoftmaxTree<f64> = serde_json::from_str(&json).unwrap();

    assert_eq!(layer.weight(), back.weight());
    assert_eq!(layer.bias(), back.bias());

    // The cache is not persisted; both copies produce the same fresh output.
    let input = array![[0.1, -0.2, 0.3]];
    let out_a = layer.clone().update_output(input.view(), &[4]).unwrap();
    let out_b = back.clone().update_output(input.view(), &[4]).unwrap();
    assert_abs_diff_eq!(out_a[0], out_b[0], epsilon = 1e-15);
}

#[test]
fn deserializing_parent_without_children_is_rejected() {
    // Node 2 claims node 1 as its parent, but node 1 has no children entry.
    let json = r#"{
        "parent": [4294967295, 0],
        "child_pos": [4294967295, 0],
        "row_offset": [4294967295, 4294967295],
        "n_children": [0, 0],
        "root": 0,
        "n_rows": 0
    }"#;
    let err = serde_json::from_str::<TreeIndex>(json).unwrap_err();
    assert!(err.to_string().contains("no children entry"));
}

#[test]
fn deserializing_out_of_range_parent_is_rejected() {
    // Node 2's parent id points outside the two-node id space.
    let json = r#"{
        "parent": [4294967295, 7],
        "child_pos": [4294967295, 0],
        "row_offset": [0, 4294967295],
        "n_children": [2, 0],
        "root": 0,
        "n_rows": 2
    }"#;
    let err = serde_json::from_str::<TreeIndex>(json).unwrap_err();
    assert!(err.to_string().contains("out of range"));
}

#[test]
fn deserializing_inconsistent_row_count_is_rejected() {
    // Well-formed tables, but the recorded row total does not match them.
    let json = r#"{
        "parent": [4294967295, 0, 0],
        "child_pos": [4294967295, 0, 1],
        "row_offset": [0, 4294967295, 4294967295],
        "n_children": [2, 0, 0],
        "root": 0,
        "n_rows": 7
    }"#;
    let err = serde_json::from_str::<TreeIndex>(json).unwrap_err();
    assert!(err.to_string().contains("inconsistent"));
}

// =============================================================================
// Variable Depth
// =============================================================================

#[test]
fn samples_in_one_batch_may_traverse_different_depths() {
    let mut layer = seeded_layer(mixed_arity_tree(), 3, 21);
    // Leaf 3 is one hop from the root, leaf 6 is two.
    let input = array![[0.2, 0.4, -0.6], [0.2, 0.4, -0.6]];
    let targets = [3i64, 6];

    let out = layer.update_output(input.view(), &targets).unwrap();
    // Depth-1 sample visits the root only (3 entries); depth-2 sample adds
    // root + node 2 (3 + 2 entries).
    assert_eq!(out.len(), 2);

    let grad = layer
        .update_grad_input(input.view(), array![1.0, 1.0].view(), &targets)
        .unwrap();
    assert_eq!(grad.dim(), (2, 3));
    // Same features, different leaves: the log-probabilities differ.
    assert_ne!(out[0], out[1]);
}
