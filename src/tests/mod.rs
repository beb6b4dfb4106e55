//! Cross-component scenario tests exercising the full submit → execute →
//! deliver path on throwaway runtimes.

#[cfg(test)]
mod helpers;

#[cfg(test)]
mod scenarios;
