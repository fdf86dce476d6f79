pub mod predictor;
pub mod scorer;

#[cfg(test)]
mod end_to_end;
