mod policy;
mod shaping;
