#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Scale so the extent along one axis becomes `target`, keeping the aspect
    /// ratio. The other axis never drops below one pixel.
    pub fn scale_width_to(&self, target: u32) -> Self {
        let height = (self.height as u64 * target as u64 + self.width as u64 / 2) / self.width.max(1) as u64;
        Self::new(target, (height as u32).max(1))
    }

    pub fn scale_height_to(&self, target: u32) -> Self {
        let width = (self.width as u64 * target as u64 + self.height as u64 / 2) / self.height.max(1) as u64;
        Self::new((width as u32).max(1), target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaling_keeps_aspect_ratio() {
        let size = ImageSize::new(2000, 1500);
        assert_eq!(size.scale_width_to(1200), ImageSize::new(1200, 900));
        assert_eq!(size.scale_width_to(300), ImageSize::new(300, 225));
        assert_eq!(size.scale_height_to(600), ImageSize::new(800, 600));
    }

    #[test]
    fn test_scaling_never_collapses_an_axis() {
        let strip = ImageSize::new(4000, 2);
        assert_eq!(strip.scale_width_to(100), ImageSize::new(100, 1));
    }
}
