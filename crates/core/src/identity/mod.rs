pub mod affect;
pub mod traits;
pub mod voice;
