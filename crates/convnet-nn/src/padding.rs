use std::str::FromStr;

use crate::error::NnError;

/// Zero-padding policy of the convolution kernels.
///
/// Padding is virtual: out-of-range input coordinates contribute zero to the
/// sums and are skipped by clamping loop bounds, never by materializing a
/// padded buffer. Each variant carries its own offset computation for the
/// forward pass and for the two backward passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Pad by half the kernel size so the output spatial size equals the
    /// input spatial size.
    Same,
    /// No padding; the output shrinks by the kernel size minus one.
    Valid,
}

impl Padding {
    /// Spatial size of the forward output for the given input and kernel sizes.
    ///
    /// # Errors
    ///
    /// For [`Padding::Valid`], returns [`NnError::KernelTooLarge`] when the
    /// kernel exceeds the input in either dimension, which would make the
    /// output dimension non-positive.
    ///
    /// # Example
    ///
    /// ```
    /// use convnet_nn::padding::Padding;
    ///
    /// assert_eq!(Padding::Same.output_size((5, 7), (3, 3)).unwrap(), (5, 7));
    /// assert_eq!(Padding::Valid.output_size((5, 7), (3, 3)).unwrap(), (3, 5));
    /// assert!(Padding::Valid.output_size((2, 2), (3, 3)).is_err());
    /// ```
    pub fn output_size(
        &self,
        input: (usize, usize),
        kernel: (usize, usize),
    ) -> Result<(usize, usize), NnError> {
        match self {
            Padding::Same => Ok(input),
            Padding::Valid => {
                if kernel.0 > input.0 || kernel.1 > input.1 {
                    return Err(NnError::KernelTooLarge(
                        kernel.0, kernel.1, input.0, input.1,
                    ));
                }
                Ok((input.0 - kernel.0 + 1, input.1 - kernel.1 + 1))
            }
        }
    }

    /// Offsets subtracted from the input coordinates in the forward pass.
    pub fn forward_offsets(&self, kernel: (usize, usize)) -> (usize, usize) {
        match self {
            Padding::Same => (kernel.0 / 2, kernel.1 / 2),
            Padding::Valid => (0, 0),
        }
    }

    /// Offsets of the input-gradient (adjoint) pass.
    ///
    /// For [`Padding::Valid`] this is the full kernel overlap `k - 1`, the
    /// standard adjoint padding for a no-pad forward pass.
    pub fn input_grad_offsets(&self, kernel: (usize, usize)) -> (usize, usize) {
        match self {
            Padding::Same => (kernel.0 / 2, kernel.1 / 2),
            Padding::Valid => (kernel.0 - 1, kernel.1 - 1),
        }
    }

    /// Offsets of the filter-gradient pass.
    pub fn filter_grad_offsets(&self, kernel: (usize, usize)) -> (usize, usize) {
        match self {
            Padding::Same => (kernel.0 / 2, kernel.1 / 2),
            Padding::Valid => (0, 0),
        }
    }
}

impl FromStr for Padding {
    type Err = NnError;

    /// Parses the `"same"` / `"valid"` string convention.
    ///
    /// # Example
    ///
    /// ```
    /// use convnet_nn::padding::Padding;
    ///
    /// assert_eq!("same".parse::<Padding>().unwrap(), Padding::Same);
    /// assert_eq!("valid".parse::<Padding>().unwrap(), Padding::Valid);
    /// assert!("reflect".parse::<Padding>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "same" => Ok(Padding::Same),
            "valid" => Ok(Padding::Valid),
            other => Err(NnError::InvalidPaddingMode(other.to_string())),
        }
    }
}
