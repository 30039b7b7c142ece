use candle_core::{Device, Result, Tensor};

pub fn mask_to_index(mask: &Tensor) -> Result<Tensor> {
    Tensor::from_iter(
        mask.to_vec1()?
            .into_iter()
            .enumerate()
            .filter_map(|(idx, m): (_, u8)| if m == 0 { None } else { Some(idx as u32) }),
        mask.device(),
    )
}

/// 1-D `u32` index tensor; an empty slice yields a `(0,)` tensor.
pub fn index_tensor(indices: &[u32], device: &Device) -> Result<Tensor> {
    Tensor::from_slice(indices, indices.len(), device)
}
