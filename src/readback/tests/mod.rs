mod helpers;
mod tests_live;
