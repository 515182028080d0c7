/// tiny module to set up logging and save chromatograms into files
pub mod logger;
