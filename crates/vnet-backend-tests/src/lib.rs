pub mod smoke;
#[cfg(feature = "torch")]
pub mod torch_parity;

#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use std::sync::Arc;

            use $crate::smoke;

            macro_rules! smoke_test {
                ($name:ident, $func:path) => {
                    #[test]
                    fn $name() {
                        let backend = ($backend_ctor)();
                        $func(&backend);
                    }
                };
            }

            smoke_test!(smoke_conv2d_matches_expected, smoke::conv2d_matches_expected);
            smoke_test!(smoke_conv_transpose2d_matches_expected, smoke::conv_transpose2d_matches_expected);
            smoke_test!(smoke_group_norm_matches_expected, smoke::group_norm_matches_expected);
            smoke_test!(smoke_activations_match_expected, smoke::activations_match_expected);
            smoke_test!(smoke_softmax_over_channels_matches_expected, smoke::softmax_over_channels_matches_expected);
            smoke_test!(smoke_concat_preserves_operand_order, smoke::concat_preserves_operand_order);
            smoke_test!(smoke_dropout2d_zeroes_whole_channels, smoke::dropout2d_zeroes_whole_channels);
            smoke_test!(smoke_vnet2d_forward_shape, smoke::vnet2d_forward_shape);
            smoke_test!(smoke_vnet2d_single_class_uses_sigmoid, smoke::vnet2d_single_class_uses_sigmoid);
            smoke_test!(smoke_checkpoint_roundtrip, smoke::checkpoint_roundtrip);

            #[cfg(feature = "torch")]
            mod torch_parity_tests {
                use super::*;

                use $crate::torch_parity::{activations, vision_ops, vnet2d};

                macro_rules! parity_test {
                    ($name:ident, $func:path) => {
                        #[test]
                        fn $name() {
                            let backend = ($backend_ctor)();
                            $func(&backend);
                        }
                    };
                }

            parity_test!(torch_vision_conv2d_k3_s1_p1_bias_n1_h11_w13_c3_cout8, vision_ops::conv2d_k3_s1_p1_bias_n1_h11_w13_c3_cout8);
            parity_test!(torch_vision_conv2d_k2_s2_p0_bias_n2_h16_w16_c16_cout32, vision_ops::conv2d_k2_s2_p0_bias_n2_h16_w16_c16_cout32);
            parity_test!(torch_vision_conv2d_k1_s1_p0_nobias_n1_h8_w8_c32_cout16, vision_ops::conv2d_k1_s1_p0_nobias_n1_h8_w8_c32_cout16);
            parity_test!(torch_vision_conv2d_k3_s1_p2_d2_bias_n1_h13_w13_c4_cout8, vision_ops::conv2d_k3_s1_p2_d2_bias_n1_h13_w13_c4_cout8);
            parity_test!(torch_vision_group_conv2d_g2_k3_s1_p1_bias_n1_h11_w11_c8_cout12, vision_ops::group_conv2d_g2_k3_s1_p1_bias_n1_h11_w11_c8_cout12);
            parity_test!(torch_vision_conv_transpose2d_k2_s2_bias_n1_h4_w4_c32_cout16, vision_ops::conv_transpose2d_k2_s2_bias_n1_h4_w4_c32_cout16);
            parity_test!(torch_vision_conv_transpose2d_k3_s2_p1_op1_nobias_n2_h5_w7_c4_cout6, vision_ops::conv_transpose2d_k3_s2_p1_op1_nobias_n2_h5_w7_c4_cout6);
            parity_test!(torch_vision_group_norm_g8_c16_matches_torch, vision_ops::group_norm_g8_c16_matches_torch);
            parity_test!(torch_vision_group_norm_g8_c256_small_spatial_matches_torch, vision_ops::group_norm_g8_c256_small_spatial_matches_torch);
            parity_test!(torch_vision_group_norm_constant_input_matches_torch, vision_ops::group_norm_constant_input_matches_torch);
            parity_test!(torch_activation_elu_matches_torch, activations::elu_matches_torch);
            parity_test!(torch_activation_prelu_per_channel_matches_torch, activations::prelu_per_channel_matches_torch);
            parity_test!(torch_activation_sigmoid_extreme_inputs_match_torch, activations::sigmoid_extreme_inputs_match_torch);
            parity_test!(torch_activation_softmax_channels_matches_torch, activations::softmax_channels_matches_torch);
            parity_test!(torch_activation_softmax_extreme_logits_matches_torch, activations::softmax_extreme_logits_matches_torch);
            parity_test!(torch_vnet2d_elu_softmax_matches_torch, vnet2d::vnet2d_elu_softmax_matches_torch);
            parity_test!(torch_vnet2d_prelu_sigmoid_matches_torch, vnet2d::vnet2d_prelu_sigmoid_matches_torch);
            }
        }
    };
}
