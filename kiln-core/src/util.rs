use anyhow::Result;
use candle_core::Tensor;
use image::DynamicImage;

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn converts_chw_u8_tensor() {
        let pixels: Vec<u8> = (0..3 * 2 * 4).map(|v| v as u8).collect();
        let tensor = Tensor::from_vec(pixels, (3, 2, 4), &Device::Cpu).unwrap();
        let image = tensor_to_image(&tensor).unwrap();
        assert_eq!((image.width(), image.height()), (4, 2));
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let tensor = Tensor::zeros((4, 2, 2), candle_core::DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }
}
