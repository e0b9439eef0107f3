pub mod candidate_scorer;
pub mod defect_fusion;
pub mod frame;
pub mod frame_aligner;
pub mod frame_selector;
pub mod grade_quantizer;
pub mod homography;
pub mod imaging;
pub mod object_localizer;
pub mod optical_flow;
pub mod region_analyzer;
pub mod regions;
pub mod visualization;
